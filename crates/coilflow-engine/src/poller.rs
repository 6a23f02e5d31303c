/*!
 * Polling engine.
 *
 * Reads the whole status bank on a fixed period, diffs it against the
 * previous snapshot and emits one [`ChangeEvent`] per changed point.
 */
use std::time::Duration;

use chrono::Utc;
use coilflow_devices::{AddressMap, DevicePoint, DeviceState};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::changelog::{ChangeEvent, ChangeLog};
use crate::error::{BridgeError, Result};
use crate::link::LinkHandle;
use crate::types::{BridgeEvent, Generation, Snapshot};

/// Owner of the live [`DeviceState`]
#[derive(Debug)]
pub struct Poller {
    link: LinkHandle,
    map: AddressMap,
    period: Duration,
    snapshot: RwLock<Snapshot>,
    changelog: ChangeLog,
    events: broadcast::Sender<BridgeEvent>,
}

impl Poller {
    /// Create a poller with an all-off snapshot
    pub fn new(
        link: LinkHandle,
        map: AddressMap,
        period: Duration,
        changelog: ChangeLog,
        events: broadcast::Sender<BridgeEvent>,
    ) -> Self {
        Self {
            link,
            map,
            period,
            snapshot: RwLock::new(Snapshot::default()),
            changelog,
            events,
        }
    }

    /// Copy of the last snapshot
    pub async fn snapshot(&self) -> Snapshot {
        *self.snapshot.read().await
    }

    /// Last polled value of one point
    pub async fn get(&self, point: DevicePoint) -> bool {
        self.snapshot.read().await.devices.get(point)
    }

    /// Polling period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Read the status bank once and publish the edges
    pub async fn poll_once(&self, generation: Option<Generation>) -> Result<Vec<ChangeEvent>> {
        let (start, count) = self.map.status_bank();
        let bits = self.link.read_bits(generation, start, count).await?;
        let next = DeviceState::from_bits(&bits);
        let now = Utc::now();

        // The previous snapshot is replaced only once every edge of this cycle is out
        let mut snapshot = self.snapshot.write().await;
        let changes: Vec<ChangeEvent> = snapshot
            .devices
            .changes(&next)
            .map(|(point, value)| ChangeEvent::at(point, value, now))
            .collect();
        for change in &changes {
            debug!("{} changed to {:?}", change.point, change.action);
            self.changelog.emit(change.clone());
            let _ = self.events.send(BridgeEvent::PointChanged(change.clone()));
        }
        snapshot.devices = next;
        snapshot.updated_at = Some(now);
        Ok(changes)
    }

    /// Poll until a read fails, returning that failure
    ///
    /// Missed ticks are skipped rather than bunched up.
    pub async fn run(&self, generation: Generation) -> BridgeError {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Polling link generation {} every {:?}", generation, self.period);

        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once(Some(generation)).await {
                warn!("Poll failed on link generation {}: {}", generation, e);
                return e;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use coilflow_devices::{ConnectionProfile, Connector, SimConnector, SimulatedPlc};

    use super::*;
    use crate::changelog::MemorySink;

    async fn fixture() -> (Poller, SimulatedPlc, MemorySink, broadcast::Receiver<BridgeEvent>) {
        let plc = SimulatedPlc::new();
        let connector = SimConnector::new(plc.clone());
        let (link, _worker) = LinkHandle::spawn(8);
        let transport = connector
            .open(&ConnectionProfile::network("sim", 502), Duration::from_secs(1))
            .await
            .unwrap();
        link.attach(transport).await.unwrap();

        let sink = MemorySink::new();
        let (changelog, _task) = ChangeLog::spawn(Arc::new(sink.clone()), Duration::from_secs(1), 64);
        let (events, rx) = broadcast::channel(16);
        let poller = Poller::new(link, AddressMap::reference(), Duration::from_millis(500), changelog, events);
        (poller, plc, sink, rx)
    }

    #[tokio::test]
    async fn test_edges_detected_once() {
        let (poller, plc, sink, mut rx) = fixture().await;

        plc.set_bit(0x01, true);
        plc.set_bit(0x07, true);
        let first = poller.poll_once(None).await.unwrap();
        assert_eq!(
            first.iter().map(|e| (e.point, e.state)).collect::<Vec<_>>(),
            vec![(DevicePoint::Fan, true), (DevicePoint::Display, true)]
        );

        let second = poller.poll_once(None).await.unwrap();
        assert!(second.is_empty(), "unchanged state must not emit");

        poller.changelog.flush().await;
        assert_eq!(sink.events().len(), 2);
        assert!(matches!(rx.recv().await.unwrap(), BridgeEvent::PointChanged(e) if e.point == DevicePoint::Fan));

        let snapshot = poller.snapshot().await;
        assert!(snapshot.devices.get(DevicePoint::Fan));
        assert!(snapshot.updated_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_snapshot_published_after_its_edges() {
        let (poller, plc, _sink, mut rx) = fixture().await;
        let poller = Arc::new(poller);

        let watcher = tokio::spawn({
            let poller = poller.clone();
            async move {
                while !poller.get(DevicePoint::LightBlue).await {
                    tokio::task::yield_now().await;
                }
                rx.try_recv()
            }
        });

        plc.set_bit(0x05, true);
        poller.poll_once(None).await.unwrap();
        let seen = watcher.await.unwrap();
        assert!(matches!(seen, Ok(BridgeEvent::PointChanged(e)) if e.point == DevicePoint::LightBlue));
    }

    #[tokio::test]
    async fn test_failed_read_keeps_snapshot() {
        let (poller, plc, _sink, _rx) = fixture().await;
        plc.set_bit(0x00, true);
        poller.poll_once(None).await.unwrap();

        plc.fail_next_reads(1);
        plc.set_bit(0x00, false);
        assert!(poller.poll_once(None).await.is_err());
        assert!(poller.get(DevicePoint::Heat).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_failure() {
        let (poller, plc, _sink, _rx) = fixture().await;
        plc.set_offline(true);
        let err = poller.run(1).await;
        assert!(matches!(err, BridgeError::Transport(_)));

        let err = poller.run(99).await;
        assert!(matches!(err, BridgeError::StaleLink { requested: 99, .. }));
    }
}
