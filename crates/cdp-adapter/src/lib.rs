//! Chrome DevTools Protocol transport for the React Native debug bridge.
//!
//! The crate owns the wire side of a debugging session: it frames CDP
//! commands as JSON envelopes, correlates responses by numeric id and hands
//! asynchronous notifications to whoever drains the event stream. It knows
//! nothing about DAP, source maps or breakpoints.

pub mod channel;
pub mod metrics;
pub mod transport;

pub use channel::{memory_channel, MemoryChannel, MessageChannel, WebSocketChannel};
pub use config::TransportConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use transport::{connect_websocket, CdpTransport, SocketTransport, TransportEvent};

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the transport.
    #[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("command timed out")]
        Timeout,
        #[error("connection closed")]
        ConnectionClosed,
        #[error("runtime reported an error")]
        Protocol,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to callers of the transport.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                data: None,
            }
        }

        /// Error reported by the runtime in a response envelope. The whole error
        /// object is kept in `data` so callers can inspect `code`/`message`.
        pub fn protocol(error: serde_json::Value) -> Self {
            let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string();
            Self::new(AdapterErrorKind::Protocol)
                .with_hint(format!("cdp error {code}: {message}"))
                .with_data(error)
        }

        pub fn closed() -> Self {
            Self::new(AdapterErrorKind::ConnectionClosed).with_hint("cdp connection closed")
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }

        pub fn is_timeout(&self) -> bool {
            self.kind == AdapterErrorKind::Timeout
        }

        pub fn is_closed(&self) -> bool {
            self.kind == AdapterErrorKind::ConnectionClosed
        }

        /// Numeric code of a runtime-reported error, if any.
        pub fn protocol_code(&self) -> Option<i64> {
            self.data.as_ref()?.get("code")?.as_i64()
        }
    }
}

pub mod config {
    use serde::{Deserialize, Serialize};
    use std::env;
    use std::time::Duration;

    /// Configuration for connecting and tuning the transport.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct TransportConfig {
        pub websocket_url: Option<String>,
        /// Applied to every command that does not carry its own timeout.
        pub default_timeout_ms: Option<u64>,
    }

    impl Default for TransportConfig {
        fn default() -> Self {
            Self {
                websocket_url: resolve_websocket_url(),
                default_timeout_ms: resolve_timeout_ms(),
            }
        }
    }

    impl TransportConfig {
        pub fn default_timeout(&self) -> Option<Duration> {
            self.default_timeout_ms.map(Duration::from_millis)
        }
    }

    fn resolve_websocket_url() -> Option<String> {
        match env::var("RN_BRIDGE_WS_URL") {
            Ok(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => None,
        }
    }

    fn resolve_timeout_ms() -> Option<u64> {
        // "0" disables the default timeout
        match env::var("RN_BRIDGE_COMMAND_TIMEOUT_MS") {
            Ok(value) => match value.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(ms) => Some(ms),
                Err(_) => Some(10_000),
            },
            Err(_) => Some(10_000),
        }
    }
}
