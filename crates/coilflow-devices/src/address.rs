/*!
 * Mapping between device points and protocol addresses.
 *
 * Each point owns one address in the status bank (read by the poller) and one
 * in the control bank (written by commands). Both banks are contiguous and in
 * point index order.
 */
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::point::{DevicePoint, POINT_COUNT};

/// Size of the 16-bit protocol address space
pub const ADDRESS_SPACE: u32 = 0x1_0000;

/// Error building an [`AddressMap`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressMapError {
    /// A bank runs past the end of the address space
    #[error("{bank} bank starting at {start:#06x} overflows the address space")]
    Overflow {
        /// Which bank
        bank: &'static str,
        /// Its first address
        start: u16,
    },

    /// The status and control banks share at least one address
    #[error("status bank {status:#06x} and control bank {control:#06x} overlap")]
    Overlap {
        /// First status address
        status: u16,
        /// First control address
        control: u16,
    },
}

/// Static point ↔ address association
///
/// Deserialization goes through [`AddressMap::new`], so a decoded map is
/// always in range and disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BankStarts")]
pub struct AddressMap {
    status_start: u16,
    control_start: u16,
}

impl AddressMap {
    /// Status bank at `0x00`, control bank at `0x10`
    pub const fn reference() -> Self {
        Self {
            status_start: 0x00,
            control_start: 0x10,
        }
    }

    /// Create a map, rejecting overflowing or overlapping banks
    pub fn new(status_start: u16, control_start: u16) -> Result<Self, AddressMapError> {
        let len = POINT_COUNT as u32;
        let status_end = u32::from(status_start) + len;
        let control_end = u32::from(control_start) + len;

        if status_end > ADDRESS_SPACE {
            return Err(AddressMapError::Overflow {
                bank: "status",
                start: status_start,
            });
        }
        if control_end > ADDRESS_SPACE {
            return Err(AddressMapError::Overflow {
                bank: "control",
                start: control_start,
            });
        }
        if u32::from(status_start) < control_end && u32::from(control_start) < status_end {
            return Err(AddressMapError::Overlap {
                status: status_start,
                control: control_start,
            });
        }

        Ok(Self {
            status_start,
            control_start,
        })
    }

    /// Address read for a point's state
    pub fn status_address(&self, point: DevicePoint) -> u16 {
        self.status_start + point.index() as u16
    }

    /// Address written to command a point
    pub fn control_address(&self, point: DevicePoint) -> u16 {
        self.control_start + point.index() as u16
    }

    /// `(start, count)` of the status bank, read in one request by the poller
    pub fn status_bank(&self) -> (u16, u16) {
        (self.status_start, POINT_COUNT as u16)
    }

}

#[derive(Deserialize)]
struct BankStarts {
    status_start: u16,
    control_start: u16,
}

impl TryFrom<BankStarts> for AddressMap {
    type Error = AddressMapError;

    fn try_from(starts: BankStarts) -> Result<Self, Self::Error> {
        Self::new(starts.status_start, starts.control_start)
    }
}

impl Default for AddressMap {
    fn default() -> Self {
        Self::reference()
    }
}
