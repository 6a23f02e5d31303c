/*!
 * Link worker: the single owner of the transport.
 *
 * Every request that touches the controller (poll reads, command writes,
 * deferred de-asserts, connection probes, raw access) is queued on one channel
 * and executed by one task, so transport operations never overlap. Each
 * attached transport gets a new [`Generation`]; requests bound to an older
 * generation fail with [`BridgeError::StaleLink`] instead of reaching a newer
 * connection.
 */
use coilflow_devices::Transport;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use coilflow_core::logging::component_span;
use tracing::{debug, info, trace, warn, Instrument};

use crate::error::{BridgeError, Result};
use crate::types::Generation;

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum LinkRequest {
    Attach {
        transport: Box<dyn Transport>,
        reply: oneshot::Sender<Generation>,
    },
    Detach {
        reply: oneshot::Sender<bool>,
    },
    ReadBits {
        generation: Option<Generation>,
        start: u16,
        count: u16,
        reply: Reply<Vec<bool>>,
    },
    ReadWords {
        generation: Option<Generation>,
        start: u16,
        count: u16,
        reply: Reply<Vec<u16>>,
    },
    WriteBit {
        generation: Option<Generation>,
        address: u16,
        value: bool,
        reply: Reply<()>,
    },
    WriteWord {
        generation: Option<Generation>,
        address: u16,
        value: u16,
        reply: Reply<()>,
    },
}

/// Cloneable handle to the link worker
///
/// Requests taking `generation: Option<Generation>` run against whatever
/// transport is attached when `None`, and only against that generation when
/// `Some`.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::Sender<LinkRequest>,
}

impl LinkHandle {
    /// Start a worker with an empty slot
    pub fn spawn(queue_capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = LinkWorker {
            rx,
            current: None,
            next_generation: 1,
        };
        (Self { tx }, tokio::spawn(worker.run().instrument(component_span("link-worker", None))))
    }

    /// Attach a freshly opened transport, replacing (and closing) any previous one
    pub async fn attach(&self, transport: Box<dyn Transport>) -> Result<Generation> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkRequest::Attach { transport, reply }).await?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    /// Close and drop the attached transport; `false` if there was none
    pub async fn detach(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkRequest::Detach { reply }).await?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    /// Read consecutive bits
    pub async fn read_bits(&self, generation: Option<Generation>, start: u16, count: u16) -> Result<Vec<bool>> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkRequest::ReadBits {
            generation,
            start,
            count,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    /// Read consecutive words
    pub async fn read_words(&self, generation: Option<Generation>, start: u16, count: u16) -> Result<Vec<u16>> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkRequest::ReadWords {
            generation,
            start,
            count,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    /// Write one bit
    pub async fn write_bit(&self, generation: Option<Generation>, address: u16, value: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkRequest::WriteBit {
            generation,
            address,
            value,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    /// Write one word
    pub async fn write_word(&self, generation: Option<Generation>, address: u16, value: u16) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(LinkRequest::WriteWord {
            generation,
            address,
            value,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BridgeError::Shutdown)?
    }

    async fn send(&self, request: LinkRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| BridgeError::Shutdown)
    }
}

struct LinkWorker {
    rx: mpsc::Receiver<LinkRequest>,
    current: Option<(Generation, Box<dyn Transport>)>,
    next_generation: Generation,
}

impl LinkWorker {
    async fn run(mut self) {
        debug!("Link worker started");
        while let Some(request) = self.rx.recv().await {
            self.handle(request).await;
        }
        self.close().await;
        debug!("Link worker stopped");
    }

    async fn handle(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Attach { transport, reply } => {
                self.close().await;
                let generation = self.next_generation;
                self.next_generation += 1;
                info!("Attached {} as link generation {}", transport.endpoint(), generation);
                self.current = Some((generation, transport));
                let _ = reply.send(generation);
            }
            LinkRequest::Detach { reply } => {
                let _ = reply.send(self.close().await);
            }
            LinkRequest::ReadBits {
                generation,
                start,
                count,
                reply,
            } => {
                let result = match self.transport(generation) {
                    Ok(transport) => transport.read_bits(start, count).await.map_err(BridgeError::from),
                    Err(e) => Err(e),
                };
                trace!("read_bits({}, {}) -> {:?}", start, count, result);
                let _ = reply.send(result);
            }
            LinkRequest::ReadWords {
                generation,
                start,
                count,
                reply,
            } => {
                let result = match self.transport(generation) {
                    Ok(transport) => transport.read_words(start, count).await.map_err(BridgeError::from),
                    Err(e) => Err(e),
                };
                trace!("read_words({}, {}) -> {:?}", start, count, result);
                let _ = reply.send(result);
            }
            LinkRequest::WriteBit {
                generation,
                address,
                value,
                reply,
            } => {
                let result = match self.transport(generation) {
                    Ok(transport) => transport.write_bit(address, value).await.map_err(BridgeError::from),
                    Err(e) => Err(e),
                };
                debug!("write_bit({:#06x}, {}) -> {:?}", address, value, result);
                let _ = reply.send(result);
            }
            LinkRequest::WriteWord {
                generation,
                address,
                value,
                reply,
            } => {
                let result = match self.transport(generation) {
                    Ok(transport) => transport.write_word(address, value).await.map_err(BridgeError::from),
                    Err(e) => Err(e),
                };
                debug!("write_word({:#06x}, {}) -> {:?}", address, value, result);
                let _ = reply.send(result);
            }
        }
    }

    fn transport(&mut self, generation: Option<Generation>) -> Result<&mut Box<dyn Transport>> {
        let current = self.current.as_ref().map(|(g, _)| *g);
        if let Some(requested) = generation {
            if current != Some(requested) {
                return Err(BridgeError::StaleLink { requested, current });
            }
        }
        self.current
            .as_mut()
            .map(|(_, transport)| transport)
            .ok_or(BridgeError::NotConnected)
    }

    async fn close(&mut self) -> bool {
        let Some((generation, mut transport)) = self.current.take() else {
            return false;
        };
        if let Err(e) = transport.disconnect().await {
            warn!("Error closing link generation {}: {}", generation, e);
        }
        info!("Detached link generation {} ({})", generation, transport.endpoint());
        true
    }
}
