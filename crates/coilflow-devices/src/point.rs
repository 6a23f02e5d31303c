/*!
 * Named boolean control points.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of points wired to the controller
pub const POINT_COUNT: usize = 8;

/// One named, boolean-controllable device on the controller
///
/// The declaration order is the wiring order: a point's index is its offset
/// inside both the status bank and the control bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePoint {
    /// Heater (climate)
    Heat,
    /// Fan (climate)
    Fan,
    /// Auxiliary actuator
    Btsp,
    /// Red light
    #[serde(alias = "light-red")]
    LightRed,
    /// Green light
    #[serde(alias = "light-green")]
    LightGreen,
    /// Blue light
    #[serde(alias = "light-blue")]
    LightBlue,
    /// White light
    #[serde(alias = "light-white")]
    LightWhite,
    /// Display panel
    Display,
}

/// Error returned when a point name is not recognised
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown device point: {0}")]
pub struct UnknownPoint(pub String);

impl DevicePoint {
    /// All points in index order
    pub const ALL: [DevicePoint; POINT_COUNT] = [
        DevicePoint::Heat,
        DevicePoint::Fan,
        DevicePoint::Btsp,
        DevicePoint::LightRed,
        DevicePoint::LightGreen,
        DevicePoint::LightBlue,
        DevicePoint::LightWhite,
        DevicePoint::Display,
    ];

    /// Offset of this point inside a bank
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Canonical snake_case name
    pub const fn as_str(self) -> &'static str {
        match self {
            DevicePoint::Heat => "heat",
            DevicePoint::Fan => "fan",
            DevicePoint::Btsp => "btsp",
            DevicePoint::LightRed => "light_red",
            DevicePoint::LightGreen => "light_green",
            DevicePoint::LightBlue => "light_blue",
            DevicePoint::LightWhite => "light_white",
            DevicePoint::Display => "display",
        }
    }
}

impl fmt::Display for DevicePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DevicePoint {
    type Err = UnknownPoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| UnknownPoint(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_order_matches_wiring() {
        for (i, point) in DevicePoint::ALL.iter().enumerate() {
            assert_eq!(point.index(), i);
        }
        assert_eq!(DevicePoint::ALL.len(), POINT_COUNT);
    }

    #[test]
    fn test_parse_accepts_both_spellings() {
        assert_eq!("light_red".parse::<DevicePoint>(), Ok(DevicePoint::LightRed));
        assert_eq!("light-red".parse::<DevicePoint>(), Ok(DevicePoint::LightRed));
        assert_eq!("FAN".parse::<DevicePoint>(), Ok(DevicePoint::Fan));
        assert_eq!(
            "toaster".parse::<DevicePoint>(),
            Err(UnknownPoint("toaster".to_string()))
        );
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&DevicePoint::LightWhite).unwrap(), "\"light_white\"");
        let point: DevicePoint = serde_json::from_str("\"light-blue\"").unwrap();
        assert_eq!(point, DevicePoint::LightBlue);
    }
}
