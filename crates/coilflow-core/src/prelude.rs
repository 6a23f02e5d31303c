/*!
 * Prelude module for CoilFlow Core.
 *
 * Re-exports the types most crates in the workspace import together.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export config types
pub use crate::config::{BridgeConfig, Config, ConfigBuilder, LinkConfig, LoggingConfig};

// Re-export utility functions
pub use crate::utils::{duration_to_millis, spawn_and_log, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};
