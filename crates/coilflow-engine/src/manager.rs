/*!
 * Connection manager.
 *
 * Drives `Disconnected -> Connecting -> Connected -> Disconnected`. A
 * connection attempt tears down whatever is attached, opens a transport, waits
 * for the controller to settle, and probes it with a one-bit read before the
 * link counts as connected. A supervisor task reacts to lost links and retries
 * on a fixed backoff while auto-retry is armed.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use coilflow_devices::{ConnectionProfile, Connector};
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use coilflow_core::logging::component_span;
use tracing::{debug, error, info, warn, Instrument};

use crate::command::PulseTracker;
use crate::error::{BridgeError, Result};
use crate::link::LinkHandle;
use crate::poller::Poller;
use crate::store::ProfileStore;
use crate::types::{BridgeEvent, Generation, LinkState, LinkStatus};

/// Address probed once after connecting
const CANARY_ADDRESS: u16 = 0;

/// Connection timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimings {
    /// Bound on opening the transport
    pub request_timeout: Duration,
    /// Pause between opening the transport and probing it
    pub settle: Duration,
    /// Delay between automatic reconnection attempts
    pub retry_backoff: Duration,
}

impl Default for ConnectionTimings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            settle: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Owner of the one active transport
#[derive(Debug)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct ManagerInner {
    connector: Arc<dyn Connector>,
    store: Arc<dyn ProfileStore>,
    link: LinkHandle,
    poller: Arc<Poller>,
    pulses: Arc<PulseTracker>,
    timings: ConnectionTimings,
    status: watch::Sender<LinkStatus>,
    events: broadcast::Sender<BridgeEvent>,
    profile: RwLock<ConnectionProfile>,
    connect_lock: AsyncMutex<()>,
    retry_armed: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    lost_tx: mpsc::UnboundedSender<Generation>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<Generation>>>,
}

impl ConnectionManager {
    /// Create a disconnected manager that will use `profile`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn ProfileStore>,
        link: LinkHandle,
        poller: Arc<Poller>,
        pulses: Arc<PulseTracker>,
        timings: ConnectionTimings,
        events: broadcast::Sender<BridgeEvent>,
        profile: ConnectionProfile,
    ) -> Self {
        let (status, _) = watch::channel(LinkStatus::disconnected());
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                store,
                link,
                poller,
                pulses,
                timings,
                status,
                events,
                profile: RwLock::new(profile),
                connect_lock: AsyncMutex::new(()),
                retry_armed: AtomicBool::new(false),
                poll_task: Mutex::new(None),
                lost_tx,
                lost_rx: Mutex::new(Some(lost_rx)),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Arm auto-retry and start the supervisor, which connects right away
    pub fn start(&self) {
        self.inner.retry_armed.store(true, Ordering::SeqCst);
        self.spawn_supervisor();
    }

    /// The supervisor handles every lost link, armed or not; it only retries while armed
    fn spawn_supervisor(&self) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_some() {
            return;
        }
        let Some(lost_rx) = self.inner.lost_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        *supervisor = Some(tokio::spawn(supervise(self.inner.clone(), lost_rx)));
        info!("Connection supervisor started");
    }

    /// Replace the profile and connect with it
    ///
    /// On failure auto-retry is disarmed and the error is returned.
    pub async fn connect(&self, profile: ConnectionProfile) -> Result<()> {
        self.spawn_supervisor();
        let _guard = self.inner.connect_lock.lock().await;
        *self.inner.profile.write().await = profile;

        match self.inner.establish().await {
            Ok(()) => {
                self.inner.retry_armed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.inner.retry_armed.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stop polling, cancel pending pulses, close the transport and disarm auto-retry
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.retry_armed.store(false, Ordering::SeqCst);
        self.inner.teardown().await;
        info!("Disconnected on request");
        Ok(())
    }

    /// Disconnect and stop the supervisor
    pub async fn shutdown(&self) {
        let supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = supervisor {
            task.abort();
        }
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.retry_armed.store(false, Ordering::SeqCst);
        self.inner.teardown().await;
    }

    /// Whether a transport is attached and answering
    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().state == LinkState::Connected
    }

    /// Current state and generation
    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    /// Follow state changes
    pub fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// Whether lost or failed links are retried automatically
    pub fn retry_armed(&self) -> bool {
        self.inner.retry_armed.load(Ordering::SeqCst)
    }

    /// Profile used for the next connection attempt
    pub async fn profile(&self) -> ConnectionProfile {
        self.inner.profile.read().await.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let supervisor = self.supervisor.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = supervisor {
            task.abort();
        }
        let poll_task = self.inner.poll_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = poll_task {
            task.abort();
        }
        self.inner.pulses.abort_all();
    }
}

impl ManagerInner {
    fn set_status(&self, status: LinkStatus) {
        let previous = self.status.send_replace(status);
        if previous.state != status.state {
            debug!("Link {} -> {}", previous.state, status.state);
            let _ = self.events.send(BridgeEvent::LinkChanged(status.state));
        }
    }

    /// Open, settle, probe; the caller holds `connect_lock`
    async fn establish(&self) -> Result<()> {
        self.teardown().await;
        let profile = self.profile.read().await.clone();
        self.set_status(LinkStatus {
            state: LinkState::Connecting,
            generation: None,
        });
        info!("Connecting to {}", profile);

        let transport = match self.connector.open(&profile, self.timings.request_timeout).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Failed to connect to {}: {}", profile, e);
                self.set_status(LinkStatus::disconnected());
                return Err(BridgeError::connect(format!("{}: {}", profile, e)));
            }
        };
        let generation = match self.link.attach(transport).await {
            Ok(generation) => generation,
            Err(e) => {
                self.set_status(LinkStatus::disconnected());
                return Err(e);
            }
        };

        tokio::time::sleep(self.timings.settle).await;
        if let Err(e) = self.link.read_bits(Some(generation), CANARY_ADDRESS, 1).await {
            error!("Controller at {} did not answer the probe read: {}", profile, e);
            if let Err(e) = self.link.detach().await {
                warn!("Detach after failed probe: {}", e);
            }
            self.set_status(LinkStatus::disconnected());
            return Err(BridgeError::connect(format!("{}: probe read failed: {}", profile, e)));
        }

        self.set_status(LinkStatus {
            state: LinkState::Connected,
            generation: Some(generation),
        });
        info!("Connected to {} (link generation {})", profile, generation);

        if let Err(e) = self.store.save(&profile).await {
            warn!("Could not persist connection profile: {}", e);
        }

        let poller = self.poller.clone();
        let lost_tx = self.lost_tx.clone();
        let span = component_span("poller", Some(&generation.to_string()));
        let task = tokio::spawn(
            async move {
                let _ = poller.run(generation).await;
                let _ = lost_tx.send(generation);
            }
            .instrument(span),
        );
        *self.poll_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Stop polling, abort pulses, detach the transport
    async fn teardown(&self) {
        let poll_task = self.poll_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = poll_task {
            task.abort();
        }
        let aborted = self.pulses.abort_all();
        if aborted > 0 {
            debug!("Cancelled {} pending pulse(s)", aborted);
        }
        if let Err(e) = self.link.detach().await {
            warn!("Detach failed: {}", e);
        }
        self.set_status(LinkStatus::disconnected());
    }

    async fn link_lost(&self, generation: Generation) {
        let _guard = self.connect_lock.lock().await;
        if self.status.borrow().generation != Some(generation) {
            debug!("Ignoring loss of superseded link generation {}", generation);
            return;
        }
        warn!("Lost link generation {}", generation);
        self.teardown().await;
    }

    async fn retry(&self) {
        if !self.retry_armed.load(Ordering::SeqCst) || self.status.borrow().state != LinkState::Disconnected {
            return;
        }
        let Ok(_guard) = self.connect_lock.try_lock() else {
            return;
        };
        // Re-check under the lock: an explicit call may have finished meanwhile
        if !self.retry_armed.load(Ordering::SeqCst) || self.status.borrow().state != LinkState::Disconnected {
            return;
        }
        if let Err(e) = self.establish().await {
            warn!("Reconnect attempt failed, retrying in {:?}: {}", self.timings.retry_backoff, e);
        }
    }
}

async fn supervise(inner: Arc<ManagerInner>, mut lost_rx: mpsc::UnboundedReceiver<Generation>) {
    inner.retry().await;
    loop {
        tokio::select! {
            lost = lost_rx.recv() => match lost {
                Some(generation) => inner.link_lost(generation).await,
                None => break,
            },
            _ = tokio::time::sleep(inner.timings.retry_backoff) => inner.retry().await,
        }
    }
}
