/*!
 * Snapshot of every point's boolean state.
 */
use std::collections::HashMap;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::point::{DevicePoint, POINT_COUNT};

/// Boolean value of every [`DevicePoint`], always total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceState([bool; POINT_COUNT]);

impl DeviceState {
    /// All points off
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a bank read in point index order
    ///
    /// Missing trailing values are treated as `false`; extra values are ignored.
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut state = Self::default();
        for (slot, bit) in state.0.iter_mut().zip(bits) {
            *slot = *bit;
        }
        state
    }

    /// Current value of a point
    pub fn get(&self, point: DevicePoint) -> bool {
        self.0[point.index()]
    }

    /// Set a point's value
    pub fn set(&mut self, point: DevicePoint, value: bool) {
        self.0[point.index()] = value;
    }

    /// Iterate `(point, value)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (DevicePoint, bool)> + '_ {
        DevicePoint::ALL.iter().map(move |p| (*p, self.get(*p)))
    }

    /// Points whose value differs in `next`, with their new value, in index order
    pub fn changes<'a>(&'a self, next: &'a DeviceState) -> impl Iterator<Item = (DevicePoint, bool)> + 'a {
        DevicePoint::ALL
            .iter()
            .copied()
            .filter(move |p| self.get(*p) != next.get(*p))
            .map(move |p| (p, next.get(p)))
    }
}

impl Serialize for DeviceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(POINT_COUNT))?;
        for (point, value) in self.iter() {
            map.serialize_entry(point.as_str(), &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DeviceState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let values = HashMap::<DevicePoint, bool>::deserialize(deserializer)?;
        let mut state = DeviceState::default();
        for (point, value) in values {
            state.set(point, value);
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_defaults_to_false() {
        let state = DeviceState::from_bits(&[true, true]);
        assert!(state.get(DevicePoint::Heat));
        assert!(state.get(DevicePoint::Fan));
        assert!(DevicePoint::ALL[2..].iter().all(|p| !state.get(*p)));
    }

    #[test]
    fn test_changes_are_in_index_order() {
        let before = DeviceState::from_bits(&[true, false, false, true]);
        let mut after = before;
        after.set(DevicePoint::Display, true);
        after.set(DevicePoint::Heat, false);
        after.set(DevicePoint::LightGreen, true);

        let changes: Vec<_> = before.changes(&after).collect();
        assert_eq!(
            changes,
            vec![
                (DevicePoint::Heat, false),
                (DevicePoint::LightGreen, true),
                (DevicePoint::Display, true),
            ]
        );
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let state = DeviceState::from_bits(&[false, true, false, true, false, true, false, true]);
        assert_eq!(state.changes(&state).count(), 0);
    }

    #[test]
    fn test_json_shape() {
        let mut state = DeviceState::new();
        state.set(DevicePoint::Fan, true);
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["fan"], true);
        assert_eq!(json["light_white"], false);
        assert_eq!(json.as_object().unwrap().len(), POINT_COUNT);

        let parsed: DeviceState = serde_json::from_str(r#"{"fan": true, "light-red": true}"#).unwrap();
        assert!(parsed.get(DevicePoint::Fan));
        assert!(parsed.get(DevicePoint::LightRed));
        assert!(!parsed.get(DevicePoint::Heat));
    }
}
