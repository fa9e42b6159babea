use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::SessionInner;
use crate::dap::StopProfilingResponse;
use crate::errors::{BridgeError, BridgeResult};
use crate::source_maps::{OriginalPosition, SourceMapRegistry};

/// Destination for finished CPU profiles.
#[async_trait]
pub trait ProfileSink: Send + Sync {
    /// Stores `profile` and returns where it went.
    async fn write(&self, profile: &Value) -> BridgeResult<String>;
}

/// Writes `profile-<uuid>.cpuprofile` files into a directory.
pub struct FileProfileSink {
    dir: PathBuf,
}

impl FileProfileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ProfileSink for FileProfileSink {
    async fn write(&self, profile: &Value) -> BridgeResult<String> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| BridgeError::Profile(format!("{}: {err}", self.dir.display())))?;
        let path = self.dir.join(format!("profile-{}.cpuprofile", Uuid::new_v4()));
        let bytes = serde_json::to_vec(profile)
            .map_err(|err| BridgeError::Profile(err.to_string()))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| BridgeError::Profile(format!("{}: {err}", path.display())))?;
        Ok(path.display().to_string())
    }
}

/// Rewrites every profile node's call frame to its original position.
/// Lookups are shared between frames with the same `(scriptId, line, column)`.
/// Returns the number of distinct generated positions translated.
pub fn annotate_profile(profile: &mut Value, registry: &SourceMapRegistry) -> usize {
    let mut cache: HashMap<(String, u64, u64), OriginalPosition> = HashMap::new();
    let Some(nodes) = profile.get_mut("nodes").and_then(Value::as_array_mut) else {
        return 0;
    };

    for node in nodes {
        let Some(frame) = node.get_mut("callFrame") else {
            continue;
        };
        let script_id = frame["scriptId"].as_str().unwrap_or_default().to_string();
        let (Some(line), Some(column)) = (frame["lineNumber"].as_i64(), frame["columnNumber"].as_i64())
        else {
            continue;
        };
        if script_id.is_empty() || line < 0 || column < 0 {
            continue;
        }

        let key = (script_id, line as u64, column as u64);
        let original = cache
            .entry(key)
            .or_insert_with_key(|(script_id, line, column)| {
                registry.to_original(script_id, *line as u32 + 1, *column as u32)
            });
        if original.is_resolved() {
            frame["url"] = json!(original.source_url);
            frame["lineNumber"] = json!(original.line - 1);
            frame["columnNumber"] = json!(original.column);
        }
    }
    cache.len()
}

impl SessionInner {
    pub(crate) async fn start_profiling(&self) -> BridgeResult<()> {
        let timeout = self.config.command_timeout();
        if let Err(err) = self
            .transport
            .send_with_timeout("Profiler.enable", json!({}), timeout)
            .await
        {
            debug!(target: "profiler", ?err, "Profiler.enable failed");
        }
        self.transport
            .send_with_timeout("Profiler.start", json!({}), timeout)
            .await?;
        info!(target: "profiler", "cpu profiling started");
        Ok(())
    }

    pub(crate) async fn stop_profiling(&self) -> BridgeResult<StopProfilingResponse> {
        let result = self
            .transport
            .send_with_timeout("Profiler.stop", json!({}), self.config.command_timeout())
            .await?;
        let mut profile = result
            .get("profile")
            .cloned()
            .ok_or_else(|| BridgeError::Profile("runtime returned no profile".to_string()))?;

        let translated = annotate_profile(&mut profile, &self.registry.read());
        let file_path = self.profile_sink.write(&profile).await?;
        info!(target: "profiler", %file_path, translated, "cpu profile written");
        Ok(StopProfilingResponse { file_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_maps::table::fixtures::APP_MAP;
    use tempfile::tempdir;

    fn profile() -> Value {
        json!({
            "nodes": [
                { "id": 1, "callFrame": { "functionName": "(root)", "scriptId": "0", "url": "", "lineNumber": -1, "columnNumber": -1 } },
                { "id": 2, "callFrame": { "functionName": "render", "scriptId": "7", "url": "http://localhost:8081/index.bundle", "lineNumber": 1, "columnNumber": 10 } },
                { "id": 3, "callFrame": { "functionName": "render", "scriptId": "7", "url": "http://localhost:8081/index.bundle", "lineNumber": 1, "columnNumber": 10 } },
                { "id": 4, "callFrame": { "functionName": "helper", "scriptId": "7", "url": "http://localhost:8081/index.bundle", "lineNumber": 3, "columnNumber": 0 } },
                { "id": 5, "callFrame": { "functionName": "native", "scriptId": "9", "url": "", "lineNumber": 0, "columnNumber": 0 } }
            ],
            "startTime": 0,
            "endTime": 10
        })
    }

    #[test]
    fn annotates_frames_once_per_position() {
        let mut registry = SourceMapRegistry::default();
        registry
            .register(APP_MAP.as_bytes(), "http://localhost:8081/index.bundle", "7", true)
            .unwrap();
        let mut profile = profile();

        let translated = annotate_profile(&mut profile, &registry);
        assert_eq!(translated, 3);

        let nodes = profile["nodes"].as_array().unwrap();
        assert_eq!(nodes[1]["callFrame"]["url"], "src/app.js");
        assert_eq!(nodes[1]["callFrame"]["lineNumber"], 9);
        assert_eq!(nodes[1]["callFrame"]["columnNumber"], 8);
        assert_eq!(nodes[2]["callFrame"], nodes[1]["callFrame"]);
        assert_eq!(nodes[3]["callFrame"]["url"], "src/util.js");
        assert_eq!(nodes[4]["callFrame"]["url"], "");
        assert_eq!(nodes[0]["callFrame"]["lineNumber"], -1);
    }

    #[tokio::test]
    async fn file_sink_writes_cpuprofile() {
        let dir = tempdir().unwrap();
        let sink = FileProfileSink::new(dir.path().join("profiles"));
        let path = sink.write(&profile()).await.unwrap();
        assert!(path.ends_with(".cpuprofile"));
        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["endTime"], 10);
    }
}
