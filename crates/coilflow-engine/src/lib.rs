/*!
 * CoilFlow Engine
 *
 * This crate keeps a live link to the controller: it owns the transport,
 * polls the status bank, serializes control commands (including momentary
 * pulses), reconnects after link loss and emits a change log.
 */

#![warn(missing_docs)]

// Re-export core types
pub use coilflow_core::prelude;

pub mod bridge;
pub mod changelog;
pub mod command;
pub mod error;
pub mod link;
pub mod manager;
pub mod poller;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use bridge::{Action, Bank, Bridge, BridgeBuilder, BridgeSettings, BridgeStatus, RawValue, RawValues, MAX_RAW_COUNT};
pub use changelog::{ChangeAction, ChangeEvent, ChangeLog, ChangeLogSink, FanoutSink, JsonLinesSink, MemorySink, SinkError, TracingSink};
pub use command::{Command, CommandSerializer, PendingPulse, PulseTracker};
pub use error::{BridgeError, Result};
pub use manager::{ConnectionManager, ConnectionTimings};
pub use store::{JsonFileProfileStore, MemoryProfileStore, ProfileStore};
pub use types::{BridgeEvent, Generation, LinkState, LinkStatus, Snapshot};

/// CoilFlow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the engine
pub fn init() -> Result<()> {
    tracing::info!("CoilFlow Engine {} initialized", VERSION);
    Ok(())
}
