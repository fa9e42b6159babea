use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;
use url::Url;

use crate::errors::{BridgeError, BridgeResult};

/// Loads the raw bytes of a script's source map.
#[async_trait]
pub trait SourceMapFetcher: Send + Sync {
    async fn fetch(&self, script_url: &str, source_map_url: &str) -> BridgeResult<Vec<u8>>;
}

/// Fetches maps from the packager over HTTP, or decodes inline `data:` URLs.
pub struct HttpSourceMapFetcher {
    client: reqwest::Client,
}

impl HttpSourceMapFetcher {
    pub fn new(timeout: Duration) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| BridgeError::Fetch(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceMapFetcher for HttpSourceMapFetcher {
    async fn fetch(&self, script_url: &str, source_map_url: &str) -> BridgeResult<Vec<u8>> {
        if let Some(inline) = decode_data_url(source_map_url)? {
            return Ok(inline);
        }

        let url = resolve_map_url(script_url, source_map_url)?;
        debug!(target: "source-maps", %url, "fetching source map");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| BridgeError::Fetch(format!("{url}: {err}")))?;
        if !response.status().is_success() {
            return Err(BridgeError::Fetch(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| BridgeError::Fetch(format!("{url}: {err}")))?;
        Ok(body.to_vec())
    }
}

/// `Some(bytes)` for a `data:` URL, `None` for anything else.
pub fn decode_data_url(raw: &str) -> BridgeResult<Option<Vec<u8>>> {
    let Some(rest) = raw.strip_prefix("data:") else {
        return Ok(None);
    };
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| BridgeError::Fetch("malformed data URL".to_string()))?;

    if meta.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        let decoded = BASE64
            .decode(payload.trim())
            .map_err(|err| BridgeError::Fetch(format!("invalid base64 source map: {err}")))?;
        Ok(Some(decoded))
    } else {
        Ok(Some(payload.as_bytes().to_vec()))
    }
}

/// Resolves a possibly relative map URL against the script that referenced it.
pub fn resolve_map_url(script_url: &str, source_map_url: &str) -> BridgeResult<Url> {
    if let Ok(absolute) = Url::parse(source_map_url) {
        return Ok(absolute);
    }
    let base = Url::parse(script_url)
        .map_err(|err| BridgeError::Fetch(format!("bad script url '{script_url}': {err}")))?;
    base.join(source_map_url)
        .map_err(|err| BridgeError::Fetch(format!("bad source map url '{source_map_url}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn decodes_inline_maps() {
        let encoded = BASE64.encode(br#"{"version":3}"#);
        let url = format!("data:application/json;charset=utf-8;base64,{encoded}");
        assert_eq!(
            decode_data_url(&url).unwrap().unwrap(),
            br#"{"version":3}"#.to_vec()
        );
        assert_eq!(
            decode_data_url("data:application/json,{}").unwrap().unwrap(),
            b"{}".to_vec()
        );
        assert!(decode_data_url("http://localhost/x.map").unwrap().is_none());
        assert!(decode_data_url("data:application/json;base64").is_err());
    }

    #[test]
    fn resolves_relative_urls_against_script() {
        let url = resolve_map_url(
            "http://localhost:8081/index.bundle?platform=ios",
            "index.map?platform=ios",
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://localhost:8081/index.map?platform=ios");

        let absolute = resolve_map_url("whatever", "http://10.0.2.2:8081/a.map").unwrap();
        assert_eq!(absolute.host_str(), Some("10.0.2.2"));
    }

    #[tokio::test]
    async fn fetches_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = r#"{"version":3,"sources":[],"names":[],"mappings":""}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let fetcher = HttpSourceMapFetcher::new(Duration::from_secs(5)).unwrap();
        let bytes = fetcher
            .fetch(&format!("http://{addr}/index.bundle"), "index.map")
            .await
            .unwrap();
        assert!(bytes.starts_with(br#"{"version":3"#));
    }
}
