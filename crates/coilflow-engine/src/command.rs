/*!
 * Command serializer.
 *
 * Validates toggle / set / momentary-pulse requests against named points and
 * turns them into writes on the control bank. A momentary pulse asserts the
 * control bit, returns, and de-asserts it from a tracked task after the pulse
 * duration; while that task is pending no other write may touch the address.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use coilflow_core::utils::spawn_and_log;
use coilflow_devices::{AddressMap, DevicePoint};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::link::LinkHandle;
use crate::poller::Poller;
use crate::types::{Generation, LinkStatus};

/// A request against one point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    /// Write the negation of the last polled value
    Toggle(DevicePoint),
    /// Write a given value
    SetExplicit(DevicePoint, bool),
    /// Write `true`, then `false` after the pulse duration
    MomentaryPulse(DevicePoint),
}

impl Command {
    /// Point targeted by this command
    pub fn point(&self) -> DevicePoint {
        match *self {
            Command::Toggle(point) | Command::SetExplicit(point, _) | Command::MomentaryPulse(point) => point,
        }
    }
}

/// A de-assert that has not run yet
#[derive(Debug)]
pub struct PendingPulse {
    /// Pulsed point
    pub point: DevicePoint,
    /// Its control address
    pub address: u16,
    /// When the de-assert is due
    pub deassert_at: Instant,
    /// Identifies this pulse among successive pulses on the same address
    pub ticket: u64,
    task: Option<JoinHandle<()>>,
}

/// Registry of pending pulses, at most one per control address
#[derive(Debug, Default)]
pub struct PulseTracker {
    pending: Mutex<HashMap<u16, PendingPulse>>,
    next_ticket: AtomicU64,
}

impl PulseTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u16, PendingPulse>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `address` for a pulse, failing if one is already pending
    pub fn reserve(&self, point: DevicePoint, address: u16, deassert_at: Instant) -> Result<u64> {
        let mut pending = self.lock();
        if pending.contains_key(&address) {
            return Err(BridgeError::PulseAlreadyInProgress(point));
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        pending.insert(
            address,
            PendingPulse {
                point,
                address,
                deassert_at,
                ticket,
                task: None,
            },
        );
        Ok(ticket)
    }

    /// Attach the de-assert task to its reservation
    ///
    /// Returns `false` (and aborts the task) if the reservation was dropped meanwhile.
    pub fn arm(&self, address: u16, ticket: u64, task: JoinHandle<()>) -> bool {
        match self.lock().get_mut(&address) {
            Some(pulse) if pulse.ticket == ticket => {
                pulse.task = Some(task);
                true
            }
            _ => {
                task.abort();
                false
            }
        }
    }

    /// Drop the reservation for `address` if it still belongs to `ticket`
    pub fn release(&self, address: u16, ticket: u64) {
        let mut pending = self.lock();
        if pending.get(&address).map(|p| p.ticket) == Some(ticket) {
            pending.remove(&address);
        }
    }

    /// Point being pulsed through `address`, if any
    pub fn pending_at(&self, address: u16) -> Option<DevicePoint> {
        self.lock().get(&address).map(|p| p.point)
    }

    /// Number of pending pulses
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no pulse is pending
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Cancel every scheduled de-assert
    pub fn abort_all(&self) -> usize {
        let drained: Vec<PendingPulse> = self.lock().drain().map(|(_, pulse)| pulse).collect();
        for pulse in &drained {
            if let Some(task) = &pulse.task {
                task.abort();
            }
            debug!("Aborted pending pulse on {} ({:#06x})", pulse.point, pulse.address);
        }
        drained.len()
    }
}

/// Executes [`Command`]s
#[derive(Debug, Clone)]
pub struct CommandSerializer {
    link: LinkHandle,
    map: AddressMap,
    poller: Arc<Poller>,
    status: watch::Receiver<LinkStatus>,
    pulses: Arc<PulseTracker>,
    pulse_duration: Duration,
}

impl CommandSerializer {
    /// Create a serializer writing through `link`
    pub fn new(
        link: LinkHandle,
        map: AddressMap,
        poller: Arc<Poller>,
        status: watch::Receiver<LinkStatus>,
        pulses: Arc<PulseTracker>,
        pulse_duration: Duration,
    ) -> Self {
        Self {
            link,
            map,
            poller,
            status,
            pulses,
            pulse_duration,
        }
    }

    /// Run one command; for a pulse this returns once the assert is written
    pub async fn execute(&self, command: Command) -> Result<()> {
        match command {
            Command::Toggle(point) => self.toggle(point).await,
            Command::SetExplicit(point, value) => self.set(point, value).await,
            Command::MomentaryPulse(point) => self.pulse(point).await,
        }
    }

    /// Write the negation of the last polled value
    ///
    /// The live state is not updated here; the next poll picks the change up.
    pub async fn toggle(&self, point: DevicePoint) -> Result<()> {
        let generation = self.generation()?;
        let address = self.unpulsed_control_address(point)?;
        let value = !self.poller.get(point).await;
        info!("Toggling {} -> {}", point, value);
        self.link.write_bit(Some(generation), address, value).await
    }

    /// Write `value` to the point's control address
    pub async fn set(&self, point: DevicePoint, value: bool) -> Result<()> {
        let generation = self.generation()?;
        let address = self.unpulsed_control_address(point)?;
        info!("Setting {} -> {}", point, value);
        self.link.write_bit(Some(generation), address, value).await
    }

    /// Assert the point's control bit and schedule its de-assert
    pub async fn pulse(&self, point: DevicePoint) -> Result<()> {
        let generation = self.generation()?;
        let address = self.map.control_address(point);
        let ticket = self
            .pulses
            .reserve(point, address, Instant::now() + self.pulse_duration)?;

        if let Err(e) = self.link.write_bit(Some(generation), address, true).await {
            self.pulses.release(address, ticket);
            return Err(e);
        }
        info!("Pulsing {} for {:?}", point, self.pulse_duration);

        let link = self.link.clone();
        let pulses = self.pulses.clone();
        let duration = self.pulse_duration;
        let task = spawn_and_log(&format!("de-assert {}", point), async move {
            tokio::time::sleep(duration).await;
            let result = link.write_bit(Some(generation), address, false).await;
            pulses.release(address, ticket);
            result
        });
        self.pulses.arm(address, ticket, task);
        Ok(())
    }

    fn generation(&self) -> Result<Generation> {
        self.status
            .borrow()
            .connected_generation()
            .ok_or(BridgeError::NotConnected)
    }

    fn unpulsed_control_address(&self, point: DevicePoint) -> Result<u16> {
        let address = self.map.control_address(point);
        match self.pulses.pending_at(address) {
            Some(pulsed) => Err(BridgeError::PulseAlreadyInProgress(pulsed)),
            None => Ok(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_allows_one_pulse_per_address() {
        let tracker = PulseTracker::new();
        let due = Instant::now() + Duration::from_millis(100);

        let ticket = tracker.reserve(DevicePoint::Fan, 0x11, due).unwrap();
        assert!(matches!(
            tracker.reserve(DevicePoint::Fan, 0x11, due),
            Err(BridgeError::PulseAlreadyInProgress(DevicePoint::Fan))
        ));
        assert!(tracker.reserve(DevicePoint::Heat, 0x10, due).is_ok());
        assert_eq!(tracker.len(), 2);

        tracker.release(0x11, ticket + 100);
        assert_eq!(tracker.pending_at(0x11), Some(DevicePoint::Fan));
        tracker.release(0x11, ticket);
        assert_eq!(tracker.pending_at(0x11), None);
    }

    #[tokio::test]
    async fn test_abort_all_cancels_tasks() {
        let tracker = PulseTracker::new();
        let ticket = tracker
            .reserve(DevicePoint::Btsp, 0x12, Instant::now())
            .unwrap();
        let task = tokio::spawn(std::future::pending::<()>());
        assert!(tracker.arm(0x12, ticket, task));

        assert_eq!(tracker.abort_all(), 1);
        assert!(tracker.is_empty());

        let late = tokio::spawn(std::future::pending::<()>());
        assert!(!tracker.arm(0x12, ticket, late));
    }

    #[test]
    fn test_command_point() {
        assert_eq!(Command::SetExplicit(DevicePoint::Heat, true).point(), DevicePoint::Heat);
        let json = serde_json::to_value(Command::MomentaryPulse(DevicePoint::Fan)).unwrap();
        assert_eq!(json["command"], "momentary_pulse");
        assert_eq!(json["args"], "fan");
    }
}
