/*!
 * The `Bridge` facade.
 *
 * Wires the link worker, connection manager, poller, command serializer and
 * change log together and exposes the operations callers (HTTP layer, CLI)
 * need: status, control, pulses, raw register access and connection control.
 */
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coilflow_core::config::BridgeConfig;
use coilflow_core::error::Error as CoreError;
use coilflow_devices::{AddressMap, ConnectionProfile, Connector, DevicePoint, DeviceState, ADDRESS_SPACE};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::changelog::{ChangeEvent, ChangeLog, ChangeLogSink, TracingSink};
use crate::command::{Command, CommandSerializer, PulseTracker};
use crate::error::{BridgeError, Result};
use crate::link::LinkHandle;
use crate::manager::{ConnectionManager, ConnectionTimings};
use crate::poller::Poller;
use crate::store::{load_or_default, MemoryProfileStore, ProfileStore};
use crate::types::{BridgeEvent, Generation, LinkState};

/// Largest quantity accepted by a raw read
pub const MAX_RAW_COUNT: u32 = 2000;

/// Bridge tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Status bank polling period
    pub poll_interval: Duration,
    /// Time between a pulse's assert and de-assert
    pub pulse_duration: Duration,
    /// Connection timings
    pub timings: ConnectionTimings,
    /// Point to address association
    pub address_map: AddressMap,
    /// Buffer of the live event channel and of the change log queue
    pub event_capacity: usize,
    /// Buffer of the link worker queue
    pub queue_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            pulse_duration: Duration::from_millis(100),
            timings: ConnectionTimings::default(),
            address_map: AddressMap::reference(),
            event_capacity: 256,
            queue_capacity: 64,
        }
    }
}

impl TryFrom<&BridgeConfig> for BridgeSettings {
    type Error = BridgeError;

    fn try_from(config: &BridgeConfig) -> Result<Self> {
        let address_map = AddressMap::new(config.status_start, config.control_start)
            .map_err(|e| CoreError::config(format!("bridge address map: {}", e)))?;
        Ok(Self {
            poll_interval: config.poll_interval(),
            pulse_duration: config.pulse_duration(),
            timings: ConnectionTimings {
                request_timeout: config.request_timeout(),
                settle: config.settle(),
                retry_backoff: config.retry_backoff(),
            },
            address_map,
            event_capacity: config.event_capacity,
            ..Self::default()
        })
    }
}

/// What to do with a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Invert the last polled value
    Toggle,
    /// Switch on
    On,
    /// Switch off
    Off,
}

impl Action {
    /// Command carrying out this action on `point`
    pub fn command(self, point: DevicePoint) -> Command {
        match self {
            Action::Toggle => Command::Toggle(point),
            Action::On => Command::SetExplicit(point, true),
            Action::Off => Command::SetExplicit(point, false),
        }
    }
}

impl FromStr for Action {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toggle" => Ok(Action::Toggle),
            "on" | "true" | "1" => Ok(Action::On),
            "off" | "false" | "0" => Ok(Action::Off),
            other => Err(BridgeError::invalid_value(format!("unknown action '{}'", other))),
        }
    }
}

/// Register bank for raw access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bank {
    /// Coils
    Bits,
    /// Holding registers
    Words,
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bank::Bits => f.write_str("bits"),
            Bank::Words => f.write_str("words"),
        }
    }
}

impl FromStr for Bank {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bits" | "coils" => Ok(Bank::Bits),
            "words" | "registers" => Ok(Bank::Words),
            other => Err(BridgeError::invalid_value(format!("unknown bank '{}'", other))),
        }
    }
}

/// Value for a raw write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Coil value
    Bit(bool),
    /// Register value
    Word(u16),
}

impl RawValue {
    /// Parse `text` as a value for `bank`
    pub fn parse(bank: Bank, text: &str) -> Result<Self> {
        let text = text.trim();
        match bank {
            Bank::Bits => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(RawValue::Bit(true)),
                "0" | "false" | "off" => Ok(RawValue::Bit(false)),
                _ => Err(BridgeError::invalid_value(format!("'{}' is not a bit value", text))),
            },
            Bank::Words => {
                let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    Some(hex) => u16::from_str_radix(hex, 16),
                    None => text.parse::<u16>(),
                };
                parsed
                    .map(RawValue::Word)
                    .map_err(|_| BridgeError::invalid_value(format!("'{}' is not a 16-bit word", text)))
            }
        }
    }
}

/// Result of a raw read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValues {
    /// Coil values
    Bits(Vec<bool>),
    /// Register values
    Words(Vec<u16>),
}

impl RawValues {
    /// Number of values
    pub fn len(&self) -> usize {
        match self {
            RawValues::Bits(bits) => bits.len(),
            RawValues::Words(words) => words.len(),
        }
    }

    /// Whether there are no values
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time view of the bridge
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    /// Whether the link is up
    pub connected: bool,
    /// Link state
    pub link: LinkState,
    /// Last polled state of every point
    pub devices: DeviceState,
    /// Profile in use
    pub profile: ConnectionProfile,
    /// Time of the last successful poll
    pub updated_at: Option<DateTime<Utc>>,
}

/// Validate a raw range, returning it in protocol width
pub fn check_range(start: u32, count: u32) -> Result<(u16, u16)> {
    if start >= ADDRESS_SPACE {
        return Err(BridgeError::InvalidAddress(start));
    }
    if count == 0 || count > MAX_RAW_COUNT || start + count > ADDRESS_SPACE {
        return Err(BridgeError::InvalidRange { start, count });
    }
    Ok((start as u16, count as u16))
}

/// Builder for [`Bridge`]
#[derive(Debug)]
pub struct BridgeBuilder {
    connector: Arc<dyn Connector>,
    settings: BridgeSettings,
    store: Option<Arc<dyn ProfileStore>>,
    sink: Option<Arc<dyn ChangeLogSink>>,
    default_profile: ConnectionProfile,
    auto_connect: bool,
}

impl BridgeBuilder {
    /// Builder opening transports with `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            settings: BridgeSettings::default(),
            store: None,
            sink: None,
            default_profile: ConnectionProfile::network("localhost", 502),
            auto_connect: true,
        }
    }

    /// Replace the tuning
    pub fn settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Persist the connection profile in `store` (in memory by default)
    pub fn store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send change events to `sink` (log lines by default)
    pub fn sink(mut self, sink: Arc<dyn ChangeLogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Profile used when the store holds none
    pub fn default_profile(mut self, profile: ConnectionProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Whether to connect at startup and keep retrying (on by default)
    ///
    /// A link opened later through [`Bridge::connect`] is supervised either way.
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Load the stored profile, spawn the background tasks and return the bridge
    pub async fn start(self) -> Result<Bridge> {
        let settings = self.settings;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryProfileStore::new()));
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let profile = load_or_default(store.as_ref(), self.default_profile).await;

        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (link, link_task) = LinkHandle::spawn(settings.queue_capacity);
        let (changelog, changelog_task) = ChangeLog::spawn(sink, settings.timings.request_timeout, settings.event_capacity);
        let poller = Arc::new(Poller::new(
            link.clone(),
            settings.address_map,
            settings.poll_interval,
            changelog.clone(),
            events.clone(),
        ));
        let pulses = Arc::new(PulseTracker::new());
        let manager = ConnectionManager::new(
            self.connector,
            store,
            link.clone(),
            poller.clone(),
            pulses.clone(),
            settings.timings,
            events.clone(),
            profile.clone(),
        );
        let commands = CommandSerializer::new(
            link.clone(),
            settings.address_map,
            poller.clone(),
            manager.watch(),
            pulses.clone(),
            settings.pulse_duration,
        );

        if self.auto_connect {
            manager.start();
        }
        info!("Bridge started with profile {}", profile);

        Ok(Bridge {
            settings,
            manager,
            commands,
            poller,
            link,
            pulses,
            changelog,
            events,
            tasks: Mutex::new(vec![link_task, changelog_task]),
        })
    }
}

/// Polling and control engine for one controller
#[derive(Debug)]
pub struct Bridge {
    settings: BridgeSettings,
    manager: ConnectionManager,
    commands: CommandSerializer,
    poller: Arc<Poller>,
    link: LinkHandle,
    pulses: Arc<PulseTracker>,
    changelog: ChangeLog,
    events: broadcast::Sender<BridgeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    /// Start building a bridge
    pub fn builder(connector: Arc<dyn Connector>) -> BridgeBuilder {
        BridgeBuilder::new(connector)
    }

    /// Tuning in effect
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Connection flag, last polled states and profile
    pub async fn status(&self) -> BridgeStatus {
        let link = self.manager.status();
        let snapshot = self.poller.snapshot().await;
        BridgeStatus {
            connected: link.state == LinkState::Connected,
            link: link.state,
            devices: snapshot.devices,
            profile: self.manager.profile().await,
            updated_at: snapshot.updated_at,
        }
    }

    /// Toggle or set a point
    pub async fn control(&self, point: DevicePoint, action: Action) -> Result<()> {
        self.commands.execute(action.command(point)).await
    }

    /// Assert a point's control bit and release it after the pulse duration
    pub async fn momentary_pulse(&self, point: DevicePoint) -> Result<()> {
        self.commands.execute(Command::MomentaryPulse(point)).await
    }

    /// Run any command
    pub async fn execute(&self, command: Command) -> Result<()> {
        self.commands.execute(command).await
    }

    /// Read `count` values from `bank` starting at `start`
    pub async fn read_raw(&self, bank: Bank, start: u32, count: u32) -> Result<RawValues> {
        let (start, count) = check_range(start, count)?;
        let generation = self.generation()?;
        debug!("Raw read of {} {} from {:#06x}", count, bank, start);
        match bank {
            Bank::Bits => self.link.read_bits(Some(generation), start, count).await.map(RawValues::Bits),
            Bank::Words => self.link.read_words(Some(generation), start, count).await.map(RawValues::Words),
        }
    }

    /// Write one value to `bank` at `address`
    pub async fn write_raw(&self, bank: Bank, address: u32, value: RawValue) -> Result<()> {
        if address >= ADDRESS_SPACE {
            return Err(BridgeError::InvalidAddress(address));
        }
        let address = address as u16;
        match (bank, value) {
            (Bank::Bits, RawValue::Bit(bit)) => {
                if let Some(point) = self.pulses.pending_at(address) {
                    return Err(BridgeError::PulseAlreadyInProgress(point));
                }
                let generation = self.generation()?;
                debug!("Raw write of bit {:#06x} = {}", address, bit);
                self.link.write_bit(Some(generation), address, bit).await
            }
            (Bank::Words, RawValue::Word(word)) => {
                let generation = self.generation()?;
                debug!("Raw write of word {:#06x} = {}", address, word);
                self.link.write_word(Some(generation), address, word).await
            }
            (bank, value) => Err(BridgeError::invalid_value(format!(
                "{:?} cannot be written to the {} bank",
                value, bank
            ))),
        }
    }

    /// Connect with a new profile, replacing the current link
    pub async fn connect(&self, profile: ConnectionProfile) -> Result<()> {
        self.manager.connect(profile).await
    }

    /// Close the link and stop automatic reconnection
    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    /// Whether the link is up; never blocks
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Wait until the link is up, at most `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut status = self.manager.watch();
        let wait = async {
            loop {
                if status.borrow_and_update().state == LinkState::Connected {
                    return Ok(());
                }
                if status.changed().await.is_err() {
                    return Err(BridgeError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| BridgeError::NotConnected)?
    }

    /// Poll the status bank now instead of waiting for the next tick
    pub async fn poll_now(&self) -> Result<Vec<ChangeEvent>> {
        let generation = self.generation()?;
        self.poller.poll_once(Some(generation)).await
    }

    /// Receive change and link events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Wait until every change event so far reached the sink
    pub async fn flush_changes(&self) {
        self.changelog.flush().await;
    }

    /// Disconnect, drain the change log and stop every background task
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        self.changelog.flush().await;
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        info!("Bridge shut down");
    }

    fn generation(&self) -> Result<Generation> {
        self.manager
            .status()
            .connected_generation()
            .ok_or(BridgeError::NotConnected)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use coilflow_devices::{SimConnector, SimOp, SimulatedPlc};

    use super::*;
    use crate::changelog::{ChangeAction, MemorySink, SinkError};
    use crate::store::JsonFileProfileStore;

    struct Harness {
        bridge: Bridge,
        plc: SimulatedPlc,
        connector: SimConnector,
        sink: MemorySink,
    }

    /// Controller whose control bank is wired back to its status bank
    fn wired_plc() -> SimulatedPlc {
        SimulatedPlc::new().with_mirror(0x10, 0x00, 8)
    }

    async fn harness_with(plc: SimulatedPlc, settings: BridgeSettings) -> Harness {
        let connector = SimConnector::new(plc.clone());
        let sink = MemorySink::new();
        let bridge = Bridge::builder(Arc::new(connector.clone()))
            .settings(settings)
            .sink(Arc::new(sink.clone()))
            .start()
            .await
            .unwrap();
        bridge.wait_connected(Duration::from_secs(5)).await.unwrap();
        Harness {
            bridge,
            plc,
            connector,
            sink,
        }
    }

    async fn harness() -> Harness {
        harness_with(wired_plc(), BridgeSettings::default()).await
    }

    #[derive(Debug, Default)]
    struct FailingSink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeLogSink for FailingSink {
        async fn record(&self, _event: &ChangeEvent) -> std::result::Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SinkError::Rejected("database unavailable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_shape() {
        let h = harness().await;
        h.plc.clear_operations();

        h.bridge.momentary_pulse(DevicePoint::Fan).await.unwrap();
        assert_eq!(h.plc.writes_to(0x11), vec![true]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.plc.writes_to(0x11), vec![true, false]);

        let writes: Vec<_> = h
            .plc
            .timed_operations()
            .into_iter()
            .filter(|(_, op)| matches!(op, SimOp::WriteBit { address: 0x11, .. }))
            .map(|(at, _)| at)
            .collect();
        let gap = writes[1] - writes[0];
        assert!(gap >= Duration::from_millis(100), "de-assert came after {:?}", gap);
        assert!(gap < Duration::from_millis(110), "de-assert came after {:?}", gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_exclusivity() {
        let h = harness().await;

        h.bridge.momentary_pulse(DevicePoint::Fan).await.unwrap();
        assert!(matches!(
            h.bridge.momentary_pulse(DevicePoint::Fan).await,
            Err(BridgeError::PulseAlreadyInProgress(DevicePoint::Fan))
        ));
        assert!(matches!(
            h.bridge.control(DevicePoint::Fan, Action::Toggle).await,
            Err(BridgeError::PulseAlreadyInProgress(DevicePoint::Fan))
        ));
        assert!(matches!(
            h.bridge.write_raw(Bank::Bits, 0x11, RawValue::Bit(true)).await,
            Err(BridgeError::PulseAlreadyInProgress(DevicePoint::Fan))
        ));
        // Other points are unaffected
        h.bridge.momentary_pulse(DevicePoint::Heat).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.bridge.momentary_pulse(DevicePoint::Fan).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.plc.writes_to(0x11), vec![true, false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_writes_negated_polled_value() {
        let h = harness().await;
        h.plc.set_bit(0x01, true);
        h.bridge.poll_now().await.unwrap();
        h.plc.clear_operations();

        h.bridge.control(DevicePoint::Fan, Action::Toggle).await.unwrap();
        assert_eq!(h.plc.writes_to(0x11), vec![false]);
        // No optimistic update: the snapshot changes with the next poll
        assert!(h.bridge.status().await.devices.get(DevicePoint::Fan));

        h.bridge.poll_now().await.unwrap();
        assert!(!h.bridge.status().await.devices.get(DevicePoint::Fan));

        h.bridge.control(DevicePoint::Fan, Action::Toggle).await.unwrap();
        assert_eq!(h.plc.writes_to(0x11), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_set() {
        let h = harness().await;
        h.bridge.control(DevicePoint::LightBlue, Action::On).await.unwrap();
        h.bridge.control(DevicePoint::LightBlue, Action::On).await.unwrap();
        h.bridge.control(DevicePoint::LightBlue, Action::Off).await.unwrap();
        assert_eq!(h.plc.writes_to(0x15), vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_ops_never_overlap() {
        let h = harness().await;
        h.plc.set_latency(Duration::from_millis(20));
        let bridge = Arc::new(h.bridge);

        let mut tasks = Vec::new();
        for point in DevicePoint::ALL {
            let bridge = bridge.clone();
            tasks.push(tokio::spawn(async move {
                bridge.control(point, Action::On).await.unwrap();
                bridge.read_raw(Bank::Words, 100, 4).await.unwrap();
                bridge.momentary_pulse(point).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(h.plc.operations().len() > 16);
        assert_eq!(h.plc.max_concurrency(), 1);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_failing_sink_never_stops_polling() {
        let plc = wired_plc();
        let connector = SimConnector::new(plc.clone());
        let sink = Arc::new(FailingSink::default());
        let bridge = Bridge::builder(Arc::new(connector))
            .sink(sink.clone())
            .start()
            .await
            .unwrap();
        bridge.wait_connected(Duration::from_secs(5)).await.unwrap();

        // Step between poll ticks so each cycle sees exactly one poll
        let period = bridge.settings().poll_interval;
        tokio::time::sleep(period / 2).await;
        for cycle in 0..100 {
            plc.set_bit(0x02, cycle % 2 == 0);
            tokio::time::sleep(period).await;
        }
        bridge.flush_changes().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 100);
        assert!(bridge.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_bounds_rejected_without_transport_call() {
        let h = harness().await;
        h.plc.clear_operations();

        assert!(matches!(
            h.bridge.read_raw(Bank::Bits, 65530, 10).await,
            Err(BridgeError::InvalidRange { start: 65530, count: 10 })
        ));
        assert!(matches!(
            h.bridge.read_raw(Bank::Words, 65536, 1).await,
            Err(BridgeError::InvalidAddress(65536))
        ));
        assert!(matches!(
            h.bridge.read_raw(Bank::Bits, 0, 0).await,
            Err(BridgeError::InvalidRange { .. })
        ));
        assert!(matches!(
            h.bridge.read_raw(Bank::Bits, 0, 2001).await,
            Err(BridgeError::InvalidRange { .. })
        ));
        assert!(matches!(
            h.bridge.write_raw(Bank::Words, 70000, RawValue::Word(1)).await,
            Err(BridgeError::InvalidAddress(70000))
        ));
        assert!(matches!(
            h.bridge.write_raw(Bank::Words, 5, RawValue::Bit(true)).await,
            Err(BridgeError::InvalidValue(_))
        ));
        assert!(h
            .plc
            .operations()
            .iter()
            .all(|op| matches!(op, SimOp::ReadBits { start: 0, count: 8 })));

        let edge = h.bridge.read_raw(Bank::Bits, 65528, 8).await.unwrap();
        assert_eq!(edge.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raw_round_trip() {
        let h = harness().await;
        h.bridge.write_raw(Bank::Words, 300, RawValue::Word(0xBEEF)).await.unwrap();
        h.bridge.write_raw(Bank::Bits, 0x200, RawValue::Bit(true)).await.unwrap();

        assert_eq!(
            h.bridge.read_raw(Bank::Words, 299, 3).await.unwrap(),
            RawValues::Words(vec![0, 0xBEEF, 0])
        );
        assert_eq!(
            h.bridge.read_raw(Bank::Bits, 0x200, 2).await.unwrap(),
            RawValues::Bits(vec![true, false])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_fail_fast_when_disconnected() {
        let h = harness().await;
        h.bridge.disconnect().await.unwrap();
        h.plc.clear_operations();

        assert!(matches!(
            h.bridge.control(DevicePoint::Heat, Action::On).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            h.bridge.momentary_pulse(DevicePoint::Heat).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            h.bridge.read_raw(Bank::Bits, 0, 8).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(h.plc.operations().is_empty());
        assert!(!h.bridge.status().await.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_pulse() {
        let h = harness().await;
        h.bridge.momentary_pulse(DevicePoint::Display).await.unwrap();
        h.bridge.disconnect().await.unwrap();
        assert_eq!(h.connector.live(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.plc.writes_to(0x17), vec![true]);

        h.bridge
            .connect(ConnectionProfile::network("localhost", 502))
            .await
            .unwrap();
        h.bridge.momentary_pulse(DevicePoint::Display).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_is_reported() {
        let h = harness().await;
        h.connector.set_refuse(true);

        let result = h.bridge.connect(ConnectionProfile::network("10.9.9.9", 502)).await;
        assert!(matches!(result, Err(BridgeError::Connect(_))));
        assert!(!h.bridge.is_connected());
        assert_eq!(h.bridge.status().await.profile, ConnectionProfile::network("10.9.9.9", 502));

        h.connector.set_refuse(false);
        let opened = h.connector.opened();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.connector.opened(), opened, "a failed explicit connect disarms retries");
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_recovered_without_auto_connect() {
        let plc = wired_plc();
        let connector = SimConnector::new(plc.clone());
        let bridge = Bridge::builder(Arc::new(connector.clone()))
            .auto_connect(false)
            .start()
            .await
            .unwrap();
        bridge.connect(ConnectionProfile::network("h", 1)).await.unwrap();
        assert!(bridge.is_connected());

        plc.set_offline(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!bridge.is_connected());
        assert_eq!(connector.live(), 0);

        plc.set_offline(false);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(bridge.is_connected());
        assert!(connector.opened() >= 2);

        let before = bridge.status().await.updated_at;
        plc.set_bit(0x00, true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = bridge.status().await;
        assert!(status.devices.get(DevicePoint::Heat));
        assert_ne!(status.updated_at, before);
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_events_are_published() {
        let h = harness().await;
        let mut events = h.bridge.subscribe();

        h.bridge.disconnect().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            BridgeEvent::LinkChanged(LinkState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_profile_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plc-connection.json");
        let settings = BridgeSettings {
            timings: ConnectionTimings {
                settle: Duration::from_millis(5),
                ..ConnectionTimings::default()
            },
            ..BridgeSettings::default()
        };
        let fallback = ConnectionProfile::network("localhost", 502);
        let chosen = ConnectionProfile::network("h", 1);

        let plc = wired_plc();
        let first = Bridge::builder(Arc::new(SimConnector::new(plc.clone())))
            .settings(settings)
            .store(Arc::new(JsonFileProfileStore::new(&path)))
            .default_profile(fallback.clone())
            .auto_connect(false)
            .start()
            .await
            .unwrap();
        assert_eq!(first.status().await.profile, fallback);
        first.connect(chosen.clone()).await.unwrap();
        first.shutdown().await;

        let second = Bridge::builder(Arc::new(SimConnector::new(plc)))
            .settings(settings)
            .store(Arc::new(JsonFileProfileStore::new(&path)))
            .default_profile(fallback)
            .auto_connect(false)
            .start()
            .await
            .unwrap();
        assert_eq!(second.status().await.profile, chosen);
        second.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_pulse_end_to_end() {
        let settings = BridgeSettings {
            poll_interval: Duration::from_secs(3600),
            ..BridgeSettings::default()
        };
        let h = harness_with(wired_plc(), settings).await;
        h.bridge.flush_changes().await;
        assert!(h.sink.events().is_empty());
        assert!(!h.bridge.status().await.devices.get(DevicePoint::Fan));

        h.bridge.momentary_pulse(DevicePoint::Fan).await.unwrap();
        let rising = h.bridge.poll_now().await.unwrap();
        assert_eq!(rising.len(), 1);
        assert_eq!((rising[0].point, rising[0].state), (DevicePoint::Fan, true));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let falling = h.bridge.poll_now().await.unwrap();
        assert_eq!(falling.len(), 1);
        assert_eq!((falling[0].point, falling[0].state), (DevicePoint::Fan, false));
        assert!(falling[0].timestamp >= rising[0].timestamp);

        h.bridge.flush_changes().await;
        let recorded: Vec<_> = h.sink.events().iter().map(|e| (e.point, e.action)).collect();
        assert_eq!(
            recorded,
            vec![(DevicePoint::Fan, ChangeAction::On), (DevicePoint::Fan, ChangeAction::Off)]
        );
    }

    #[test]
    fn test_parsing_helpers() {
        assert_eq!("Toggle".parse::<Action>().unwrap(), Action::Toggle);
        assert_eq!("off".parse::<Action>().unwrap(), Action::Off);
        assert!("blink".parse::<Action>().is_err());
        assert_eq!("coils".parse::<Bank>().unwrap(), Bank::Bits);
        assert_eq!(RawValue::parse(Bank::Words, "0x1F").unwrap(), RawValue::Word(31));
        assert_eq!(RawValue::parse(Bank::Bits, "on").unwrap(), RawValue::Bit(true));
        assert!(RawValue::parse(Bank::Words, "70000").is_err());
        assert_eq!(check_range(65528, 8).unwrap(), (65528, 8));
    }

    #[test]
    fn test_settings_from_config() {
        let config = BridgeConfig::default();
        let settings = BridgeSettings::try_from(&config).unwrap();
        assert_eq!(settings, BridgeSettings::default());

        let overlapping = BridgeConfig {
            control_start: 4,
            ..BridgeConfig::default()
        };
        assert!(matches!(
            BridgeSettings::try_from(&overlapping),
            Err(BridgeError::Core(_))
        ));
    }
}
