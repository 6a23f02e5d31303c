/*!
 * In-memory simulated controller.
 *
 * `SimulatedPlc` is a shared coil/register table with the same surface as a
 * real controller. It can mirror the control bank onto the status bank (the
 * way relays wired back to inputs behave), inject failures, add latency and
 * record every operation, which makes it the fixture for engine tests and for
 * dry runs without hardware.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use crate::profile::ConnectionProfile;
use crate::transport::{Connector, Result, Transport, TransportError};

/// One operation observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    /// Coil read
    ReadBits {
        /// First address
        start: u16,
        /// Quantity
        count: u16,
    },
    /// Register read
    ReadWords {
        /// First address
        start: u16,
        /// Quantity
        count: u16,
    },
    /// Coil write
    WriteBit {
        /// Address
        address: u16,
        /// Written value
        value: bool,
    },
    /// Register write
    WriteWord {
        /// Address
        address: u16,
        /// Written value
        value: u16,
    },
}

#[derive(Debug, Clone, Copy)]
struct Mirror {
    control_start: u16,
    status_start: u16,
    len: u16,
}

#[derive(Debug, Default)]
struct Table {
    bits: HashMap<u16, bool>,
    words: HashMap<u16, u16>,
    mirror: Option<Mirror>,
    fail_reads: usize,
    fail_writes: usize,
    log: Vec<(Instant, SimOp)>,
}

#[derive(Debug, Default)]
struct Inner {
    table: Mutex<Table>,
    offline: AtomicBool,
    latency_ms: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Shared handle to a simulated controller
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlc {
    inner: Arc<Inner>,
}

impl SimulatedPlc {
    /// A controller with every coil and register at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflect writes to `control_start..control_start+len` onto the status bank
    pub fn with_mirror(self, control_start: u16, status_start: u16, len: u16) -> Self {
        self.table().mirror = Some(Mirror {
            control_start,
            status_start,
            len,
        });
        self
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// While offline every operation fails with an I/O error
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` reads with a protocol error
    pub fn fail_next_reads(&self, n: usize) {
        self.table().fail_reads = n;
    }

    /// Fail the next `n` writes with a protocol error
    pub fn fail_next_writes(&self, n: usize) {
        self.table().fail_writes = n;
    }

    /// Set a coil directly, as field wiring would
    pub fn set_bit(&self, address: u16, value: bool) {
        self.table().bits.insert(address, value);
    }

    /// Current coil value
    pub fn bit(&self, address: u16) -> bool {
        self.table().bits.get(&address).copied().unwrap_or(false)
    }

    /// Current register value
    pub fn word(&self, address: u16) -> u16 {
        self.table().words.get(&address).copied().unwrap_or(0)
    }

    /// Every operation so far, oldest first
    pub fn operations(&self) -> Vec<SimOp> {
        self.table().log.iter().map(|(_, op)| op.clone()).collect()
    }

    /// Every operation with the instant it completed
    pub fn timed_operations(&self) -> Vec<(Instant, SimOp)> {
        self.table().log.clone()
    }

    /// Writes addressed to one coil, in order
    pub fn writes_to(&self, address: u16) -> Vec<bool> {
        self.table()
            .log
            .iter()
            .filter_map(|(_, op)| match op {
                SimOp::WriteBit { address: a, value } if *a == address => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Forget the operation log
    pub fn clear_operations(&self) {
        self.table().log.clear();
    }

    /// Highest number of operations ever executing at the same time
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// A new transport bound to this controller
    pub fn transport(&self, endpoint: impl Into<String>) -> SimTransport {
        SimTransport {
            plc: self.clone(),
            endpoint: endpoint.into(),
            open: true,
            live: None,
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // A panicking test thread must not hide the table from the others
        self.inner.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn execute(&self, op: SimOp) -> Result<Option<Reply>> {
        let running = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }

        let result = self.apply(op);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn apply(&self, op: SimOp) -> Result<Option<Reply>> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated controller offline",
            )));
        }

        let mut table = self.table();
        let is_read = matches!(op, SimOp::ReadBits { .. } | SimOp::ReadWords { .. });
        let pending_failures = if is_read {
            &mut table.fail_reads
        } else {
            &mut table.fail_writes
        };
        if *pending_failures > 0 {
            *pending_failures -= 1;
            return Err(TransportError::Protocol("simulated exception: slave device failure".to_string()));
        }

        trace!("simulated controller: {:?}", op);
        let reply = match op {
            SimOp::ReadBits { start, count } => Some(Reply::Bits(
                (0..count)
                    .map(|i| table.bits.get(&start.wrapping_add(i)).copied().unwrap_or(false))
                    .collect(),
            )),
            SimOp::ReadWords { start, count } => Some(Reply::Words(
                (0..count)
                    .map(|i| table.words.get(&start.wrapping_add(i)).copied().unwrap_or(0))
                    .collect(),
            )),
            SimOp::WriteBit { address, value } => {
                table.bits.insert(address, value);
                if let Some(mirror) = table.mirror {
                    if let Some(offset) = address.checked_sub(mirror.control_start) {
                        if offset < mirror.len {
                            table.bits.insert(mirror.status_start.wrapping_add(offset), value);
                        }
                    }
                }
                None
            }
            SimOp::WriteWord { address, value } => {
                table.words.insert(address, value);
                None
            }
        };
        table.log.push((Instant::now(), op));
        Ok(reply)
    }
}

enum Reply {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// Transport talking to a [`SimulatedPlc`]
#[derive(Debug)]
pub struct SimTransport {
    plc: SimulatedPlc,
    endpoint: String,
    open: bool,
    live: Option<Arc<AtomicUsize>>,
}

impl SimTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn release(&mut self) {
        if self.open {
            self.open = false;
            if let Some(live) = self.live.take() {
                live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn read_bits(&mut self, start: u16, count: u16) -> Result<Vec<bool>> {
        self.ensure_open()?;
        match self.plc.execute(SimOp::ReadBits { start, count }).await? {
            Some(Reply::Bits(bits)) => Ok(bits),
            _ => Err(TransportError::Protocol("unexpected reply".to_string())),
        }
    }

    async fn read_words(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        self.ensure_open()?;
        match self.plc.execute(SimOp::ReadWords { start, count }).await? {
            Some(Reply::Words(words)) => Ok(words),
            _ => Err(TransportError::Protocol("unexpected reply".to_string())),
        }
    }

    async fn write_bit(&mut self, address: u16, value: bool) -> Result<()> {
        self.ensure_open()?;
        self.plc.execute(SimOp::WriteBit { address, value }).await.map(|_| ())
    }

    async fn write_word(&mut self, address: u16, value: u16) -> Result<()> {
        self.ensure_open()?;
        self.plc.execute(SimOp::WriteWord { address, value }).await.map(|_| ())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

/// Connector that hands out transports to one [`SimulatedPlc`]
///
/// Tracks how many transports it opened and how many are still live.
#[derive(Debug, Clone, Default)]
pub struct SimConnector {
    plc: SimulatedPlc,
    refuse: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl SimConnector {
    /// Connector for `plc`
    pub fn new(plc: SimulatedPlc) -> Self {
        Self {
            plc,
            ..Self::default()
        }
    }

    /// The simulated controller behind this connector
    pub fn plc(&self) -> &SimulatedPlc {
        &self.plc
    }

    /// Make subsequent `open` calls fail
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful `open` calls
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Transports opened and not yet disconnected or dropped
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn open(&self, profile: &ConnectionProfile, _timeout: Duration) -> Result<Box<dyn Transport>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{}: connection refused", profile)));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        let mut transport = self.plc.transport(format!("sim+{}", profile));
        transport.live = Some(self.live.clone());
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_mirror_reflects_control_writes() {
        let plc = SimulatedPlc::new().with_mirror(0x10, 0x00, 8);
        let mut transport = plc.transport("sim");

        transport.write_bit(0x11, true).await.unwrap();
        assert_eq!(
            transport.read_bits(0, 3).await.unwrap(),
            vec![false, true, false]
        );

        transport.write_bit(0x40, true).await.unwrap();
        assert!(!plc.bit(0x30));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let plc = SimulatedPlc::new();
        let mut transport = plc.transport("sim");

        plc.fail_next_reads(1);
        assert!(matches!(transport.read_bits(0, 1).await, Err(TransportError::Protocol(_))));
        tokio_test::assert_ok!(transport.read_bits(0, 1).await);

        plc.set_offline(true);
        let err = tokio_test::assert_err!(transport.write_word(3, 7).await);
        assert!(matches!(err, TransportError::Io(_)));
        plc.set_offline(false);
        tokio_test::assert_ok!(transport.write_word(3, 7).await);
        assert_eq!(transport.read_words(3, 1).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_requests() {
        let connector = SimConnector::new(SimulatedPlc::new());
        let mut transport = connector
            .open(&ConnectionProfile::network("sim", 502), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(connector.live(), 1);

        transport.disconnect().await.unwrap();
        assert_eq!(connector.live(), 0);
        assert!(matches!(transport.write_bit(0, true).await, Err(TransportError::Closed)));

        drop(transport);
        assert_eq!(connector.live(), 0);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn test_dropping_transport_releases_it() {
        let connector = SimConnector::new(SimulatedPlc::new());
        let transport = connector
            .open(&ConnectionProfile::network("sim", 502), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(connector.live(), 1);
        drop(transport);
        assert_eq!(connector.live(), 0);
    }

    #[tokio::test]
    async fn test_refused_open() {
        let connector = SimConnector::new(SimulatedPlc::new());
        connector.set_refuse(true);
        let result = connector
            .open(&ConnectionProfile::network("sim", 502), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert_eq!(connector.opened(), 0);
    }
}
