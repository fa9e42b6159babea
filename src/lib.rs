//! React Native debug bridge
//!
//! Serves a Debug Adapter Protocol client on one side and drives a JavaScript
//! runtime over the Chrome DevTools Protocol on the other, translating
//! positions through the bundle's source maps.

pub mod breakpoints;
pub mod config;
pub mod dap;
pub mod errors;
pub mod logging;
pub mod session;
pub mod source_maps;
pub mod variables;

#[cfg(test)]
pub(crate) mod testing;

use tokio::sync::broadcast;

pub use config::{BridgeConfig, SourceMapAlias};
pub use dap::DebugEvent;
pub use errors::{BridgeError, BridgeResult};
pub use session::{DebugSession, SessionBuilder, SessionState};
pub use source_maps::{SourceMapRegistry, UNKNOWN_SOURCE};
pub use variables::VariableStore;

pub type EventBus = broadcast::Sender<DebugEvent>;

/// Creates the channel DAP events are published on.
pub fn event_bus(buffer: usize) -> (EventBus, broadcast::Receiver<DebugEvent>) {
    broadcast::channel(buffer.max(1))
}
