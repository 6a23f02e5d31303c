/*!
 * Connection profiles: how to reach the controller.
 *
 * Persisted as a single JSON record:
 * `{ "protocol": "network", "host": "10.0.0.5", "port": 502, "unitId": 1 }` or
 * `{ "protocol": "serial", "device": "/dev/ttyUSB0", "baudRate": 9600, "unitId": 1 }`.
 */
use std::fmt;

use coilflow_core::config::LinkConfig;
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Link-specific addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum LinkParams {
    /// Modbus TCP
    Network {
        /// Host name or IP address
        host: String,
        /// TCP port
        #[serde(default = "default_port")]
        port: u16,
    },
    /// Modbus RTU over a serial line (8N1)
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`
        device: String,
        /// Line speed
        #[serde(rename = "baudRate", default = "default_baud_rate")]
        baud_rate: u32,
    },
}

/// Everything needed to open a transport to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Link kind and its parameters
    #[serde(flatten)]
    pub link: LinkParams,

    /// Protocol unit (slave) address
    #[serde(rename = "unitId", default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_unit_id() -> u8 {
    1
}

impl ConnectionProfile {
    /// Modbus TCP profile with unit id 1
    pub fn network<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            link: LinkParams::Network {
                host: host.into(),
                port,
            },
            unit_id: default_unit_id(),
        }
    }

    /// Modbus RTU profile with unit id 1
    pub fn serial<S: Into<String>>(device: S, baud_rate: u32) -> Self {
        Self {
            link: LinkParams::Serial {
                device: device.into(),
                baud_rate,
            },
            unit_id: default_unit_id(),
        }
    }

    /// Replace the unit id
    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// `"network"` or `"serial"`
    pub fn protocol(&self) -> &'static str {
        match self.link {
            LinkParams::Network { .. } => "network",
            LinkParams::Serial { .. } => "serial",
        }
    }
}

impl fmt::Display for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.link {
            LinkParams::Network { host, port } => {
                write!(f, "tcp://{}:{} (unit {})", host, port, self.unit_id)
            }
            LinkParams::Serial { device, baud_rate } => {
                write!(f, "rtu://{} @{} baud (unit {})", device, baud_rate, self.unit_id)
            }
        }
    }
}

impl TryFrom<&LinkConfig> for ConnectionProfile {
    type Error = TransportError;

    fn try_from(config: &LinkConfig) -> Result<Self, Self::Error> {
        let profile = match config.protocol.as_str() {
            "network" => Self::network(config.host.clone(), config.port),
            "serial" => Self::serial(config.device.clone(), config.baud_rate),
            other => return Err(TransportError::Unsupported(other.to_string())),
        };
        Ok(profile.with_unit_id(config.unit_id))
    }
}
