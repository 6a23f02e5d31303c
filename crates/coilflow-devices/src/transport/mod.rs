/*!
 * Transport abstraction over a register-oriented request/response link.
 *
 * A [`Connector`] turns a [`ConnectionProfile`] into a live [`Transport`].
 * Callers only ever hold `Box<dyn Transport>`, so nothing above this module
 * branches on whether the link is TCP, serial or simulated.
 */
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::profile::ConnectionProfile;

#[cfg(feature = "modbus")]
pub mod modbus;
pub mod sim;

#[cfg(feature = "modbus")]
pub use modbus::{ModbusConnector, ModbusTransport};
pub use sim::{SimConnector, SimOp, SimTransport, SimulatedPlc};

/// Error type for transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link could not be opened
    #[error("Connection failed: {0}")]
    Connect(String),

    /// No response within the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The controller answered with an exception or a malformed frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The underlying byte stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was already disconnected
    #[error("Transport closed")]
    Closed,

    /// The profile asks for a link kind this build cannot open
    #[error("Unsupported link: {0}")]
    Unsupported(String),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// An open link to one controller
///
/// Implementations are not required to be safe for concurrent use; callers
/// must serialize access (the engine funnels everything through one task).
#[async_trait]
pub trait Transport: Send + Debug {
    /// Human-readable endpoint description for logs
    fn endpoint(&self) -> String;

    /// Read `count` consecutive bits (coils) starting at `start`
    async fn read_bits(&mut self, start: u16, count: u16) -> Result<Vec<bool>>;

    /// Read `count` consecutive 16-bit words (holding registers) starting at `start`
    async fn read_words(&mut self, start: u16, count: u16) -> Result<Vec<u16>>;

    /// Write a single bit
    async fn write_bit(&mut self, address: u16, value: bool) -> Result<()>;

    /// Write a single word
    async fn write_word(&mut self, address: u16, value: u16) -> Result<()>;

    /// Close the link; further calls fail with [`TransportError::Closed`]
    async fn disconnect(&mut self) -> Result<()>;
}

/// Opens transports from connection profiles
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Open a transport; every request on it is bounded by `timeout`
    async fn open(&self, profile: &ConnectionProfile, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Bound a request future by `timeout`, keeping timeouts distinct from other failures
pub async fn bounded<F, T>(timeout: Duration, request: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_reports_timeout() {
        let result: Result<()> = bounded(Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(11)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Timeout(d)) if d == Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_bounded_passes_errors_through() {
        let result: Result<()> = bounded(Duration::from_secs(1), async {
            Err(TransportError::Protocol("illegal data address".to_string()))
        })
        .await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }
}
