//! Error handling module
//!
//! Transport failures surface to the calling request; resolution problems
//! (no source map, unresolvable position) never reach this type and degrade
//! to sentinel positions or unverified breakpoints instead.

use cdp_adapter::AdapterError;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] AdapterError),
    #[error("the runtime is not paused")]
    NotPaused,
    #[error("unknown stack frame {0}")]
    UnknownFrame(u64),
    #[error("unknown or expired variables reference {0}")]
    UnknownReference(u64),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("malformed runtime payload: {0}")]
    Payload(String),
    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),
    #[error("source map error: {0}")]
    SourceMap(String),
    #[error("failed to fetch source map: {0}")]
    Fetch(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("debug session is closed")]
    Closed,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Stable numeric id for the DAP `ErrorResponse` message.
    pub fn code(&self) -> u32 {
        match self {
            BridgeError::Transport(err) if err.is_timeout() => 1001,
            BridgeError::Transport(err) if err.is_closed() => 1002,
            BridgeError::Transport(_) => 1003,
            BridgeError::Payload(_) => 1004,
            BridgeError::NotPaused => 2001,
            BridgeError::UnknownFrame(_) => 2002,
            BridgeError::UnknownReference(_) => 2003,
            BridgeError::InvalidArguments(_) => 2004,
            BridgeError::UnsupportedCommand(_) => 2005,
            BridgeError::SourceMap(_) => 3001,
            BridgeError::Fetch(_) => 3002,
            BridgeError::Profile(_) => 4001,
            BridgeError::Config(_) => 5001,
            BridgeError::Closed => 1002,
        }
    }

    /// Whether the failure ends the debug session rather than one request.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Transport(err) => err.is_closed(),
            BridgeError::Closed => true,
            _ => false,
        }
    }

    /// Body of a failed DAP response.
    pub fn error_body(&self) -> Value {
        json!({
            "error": {
                "id": self.code(),
                "format": self.to_string(),
                "showUser": matches!(self, BridgeError::Transport(_) | BridgeError::Profile(_)),
            }
        })
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        BridgeError::InvalidArguments(message.into())
    }

    /// Client-supplied JSON that does not fit the request.
    pub fn arguments(err: serde_json::Error) -> Self {
        BridgeError::InvalidArguments(err.to_string())
    }

    /// Runtime JSON that does not fit the expected CDP shape.
    pub fn payload(err: serde_json::Error) -> Self {
        BridgeError::Payload(err.to_string())
    }
}
