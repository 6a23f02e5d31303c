/*!
 * CoilFlow Devices
 *
 * This crate provides the device model (points, state snapshots, address
 * maps, connection profiles) and the transports used to reach the
 * controller.
 */

#![warn(missing_docs)]

// Re-export core types
pub use coilflow_core::prelude;

pub mod address;
pub mod point;
pub mod profile;
pub mod state;
pub mod transport;

pub use address::{AddressMap, AddressMapError, ADDRESS_SPACE};
pub use point::{DevicePoint, UnknownPoint, POINT_COUNT};
pub use profile::{ConnectionProfile, LinkParams};
pub use state::DeviceState;
pub use transport::{Connector, SimConnector, SimOp, SimulatedPlc, Transport, TransportError};

#[cfg(feature = "modbus")]
pub use transport::ModbusConnector;

/// CoilFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), coilflow_core::error::Error> {
    tracing::info!(
        "CoilFlow Devices {} initialized (transports: {})",
        VERSION,
        available_transports().join(", ")
    );
    Ok(())
}

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["sim"];

    #[cfg(feature = "modbus")]
    transports.push("modbus-tcp");

    #[cfg(feature = "serial")]
    transports.push("modbus-rtu");

    transports
}
