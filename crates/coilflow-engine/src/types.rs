/*!
 * Common engine types.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use coilflow_devices::DeviceState;
use serde::{Deserialize, Serialize};

use crate::changelog::ChangeEvent;

/// Sequence number of an attached transport
pub type Generation = u64;

/// Connection state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No transport
    Disconnected,
    /// Opening and probing a transport
    Connecting,
    /// Transport attached and answering
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Link state together with the generation of the attached transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    /// Current state
    pub state: LinkState,
    /// Attached transport, set only while connected
    pub generation: Option<Generation>,
}

impl LinkStatus {
    /// Disconnected, no transport
    pub const fn disconnected() -> Self {
        Self {
            state: LinkState::Disconnected,
            generation: None,
        }
    }

    /// Generation to bind requests to, if connected
    pub fn connected_generation(&self) -> Option<Generation> {
        match self.state {
            LinkState::Connected => self.generation,
            _ => None,
        }
    }
}

/// Last polled device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Snapshot {
    /// Value of every point
    pub devices: DeviceState,
    /// When the last successful poll completed
    pub updated_at: Option<DateTime<Utc>>,
}

/// Notification pushed to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A point changed state
    PointChanged(ChangeEvent),
    /// The link changed state
    LinkChanged(LinkState),
}
