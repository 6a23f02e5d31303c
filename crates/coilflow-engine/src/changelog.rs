/*!
 * Change log emission.
 *
 * Every detected edge becomes a [`ChangeEvent`] handed to a
 * [`ChangeLogSink`]. Events are queued and forwarded by a single task, so the
 * sink sees them in detection order and a slow or failing sink never holds up
 * polling.
 */
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coilflow_core::error::Error as CoreError;
use coilflow_core::utils::with_timeout;
use coilflow_devices::DevicePoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// History label of a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    /// Point switched on
    #[serde(rename = "ON")]
    On,
    /// Point switched off
    #[serde(rename = "OFF")]
    Off,
}

/// One detected state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Point that changed
    pub point: DevicePoint,
    /// New value
    pub state: bool,
    /// `ON` / `OFF`
    pub action: ChangeAction,
    /// `1.0` / `0.0`
    pub value: f64,
    /// Detection time
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Event for `point` switching to `state` now
    pub fn new(point: DevicePoint, state: bool) -> Self {
        Self::at(point, state, Utc::now())
    }

    /// Event for `point` switching to `state` at `timestamp`
    pub fn at(point: DevicePoint, state: bool, timestamp: DateTime<Utc>) -> Self {
        let (action, value) = if state {
            (ChangeAction::On, 1.0)
        } else {
            (ChangeAction::Off, 0.0)
        };
        Self {
            point,
            state,
            action,
            value,
            timestamp,
        }
    }
}

/// Error returned by a sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// Writing failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The event could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink refused the event
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Destination of change events
#[async_trait]
pub trait ChangeLogSink: Send + Sync + std::fmt::Debug {
    /// Record one event
    async fn record(&self, event: &ChangeEvent) -> Result<(), SinkError>;
}

enum Entry {
    Event(ChangeEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle used to emit events towards the sink
#[derive(Debug, Clone)]
pub struct ChangeLog {
    tx: mpsc::Sender<Entry>,
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Entry::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl ChangeLog {
    /// Start the forwarding task
    ///
    /// Each `record` call is bounded by `timeout`. At most `capacity` events
    /// wait for the sink; further events are dropped with a warning.
    pub fn spawn(sink: Arc<dyn ChangeLogSink>, timeout: Duration, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Entry>(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match entry {
                    Entry::Event(event) => {
                        let recorded = with_timeout(timeout, async {
                            sink.record(&event).await.map_err(|e| CoreError::other(e.to_string()))
                        })
                        .await;
                        match recorded {
                            Ok(()) => {}
                            Err(e) if e.is_timeout() => {
                                warn!("Change log sink timed out on {} -> {:?}", event.point, event.action);
                            }
                            Err(e) => {
                                warn!("Change log sink failed for {} -> {:?}: {}", event.point, event.action, e);
                            }
                        }
                    }
                    Entry::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("Change log forwarder stopped");
        });

        (Self { tx }, task)
    }

    /// Queue an event; never blocks
    pub fn emit(&self, event: ChangeEvent) {
        match self.tx.try_send(Entry::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(Entry::Event(event))) => {
                warn!(
                    "Change log queue is full, dropping {} -> {:?} at {}",
                    event.point, event.action, event.timestamp
                );
            }
            Err(_) => warn!("Change log forwarder is gone, dropping event"),
        }
    }

    /// Wait until every event emitted so far has been handed to the sink
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Entry::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Writes one structured log line per event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ChangeLogSink for TracingSink {
    async fn record(&self, event: &ChangeEvent) -> Result<(), SinkError> {
        info!(
            target: "coilflow::changes",
            point = %event.point,
            value = event.value,
            timestamp = %event.timestamp,
            "{} turned {:?}",
            event.point,
            event.action
        );
        Ok(())
    }
}

/// Appends events as JSON lines to a file
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    /// Sink appending to `path`; parent directories are created on first write
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Target file
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ChangeLogSink for JsonLinesSink {
    async fn record(&self, event: &ChangeEvent) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps events in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ChangeLogSink for MemorySink {
    async fn record(&self, event: &ChangeEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Forwards every event to several sinks
///
/// All sinks are tried; the first failure is reported.
#[derive(Debug, Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ChangeLogSink>>,
}

impl FanoutSink {
    /// Fan out to `sinks`
    pub fn new(sinks: Vec<Arc<dyn ChangeLogSink>>) -> Self {
        Self { sinks }
    }

    /// Add a sink
    pub fn with(mut self, sink: Arc<dyn ChangeLogSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl ChangeLogSink for FanoutSink {
    async fn record(&self, event: &ChangeEvent) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
