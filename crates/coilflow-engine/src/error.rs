/*!
 * Error types for the CoilFlow engine crate.
 */
use coilflow_devices::{DevicePoint, TransportError};
use thiserror::Error;

use crate::types::Generation;

/// Error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No live link to the controller
    #[error("Not connected to the controller")]
    NotConnected,

    /// A momentary pulse on this point has not finished yet
    #[error("Pulse already in progress for {0}")]
    PulseAlreadyInProgress(DevicePoint),

    /// Start address outside the 16-bit address space
    #[error("Invalid address: {0}")]
    InvalidAddress(u32),

    /// Quantity out of bounds or range running past the address space
    #[error("Invalid range: {count} item(s) from {start}")]
    InvalidRange {
        /// Requested start address
        start: u32,
        /// Requested quantity
        count: u32,
    },

    /// Value of the wrong kind for the target bank
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Opening or probing the link failed
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The transport reported a failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A deferred request was bound to a link that has since been replaced
    #[error("Link generation {requested} is gone (current: {current:?})")]
    StaleLink {
        /// Generation the request was bound to
        requested: Generation,
        /// Generation attached now, if any
        current: Option<Generation>,
    },

    /// The profile store failed
    #[error("Profile store error: {0}")]
    Store(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] coilflow_core::error::Error),

    /// The bridge has been shut down
    #[error("Bridge is shut down")]
    Shutdown,
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Create a new connection error
    pub fn connect<S: AsRef<str>>(msg: S) -> Self {
        BridgeError::Connect(msg.as_ref().to_string())
    }

    /// Create a new profile store error
    pub fn store<S: AsRef<str>>(msg: S) -> Self {
        BridgeError::Store(msg.as_ref().to_string())
    }

    /// Create a new invalid value error
    pub fn invalid_value<S: AsRef<str>>(msg: S) -> Self {
        BridgeError::InvalidValue(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Core(coilflow_core::error::Error::from(err))
    }
}
