/*!
 * Modbus TCP and RTU transports built on `tokio-modbus`.
 *
 * Bits map to coils (FC01 / FC05) and words to holding registers (FC03 / FC06).
 */
use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::profile::{ConnectionProfile, LinkParams};
use crate::transport::{bounded, Connector, Result, Transport, TransportError};

/// Opens Modbus transports for network and serial profiles
#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusConnector;

impl ModbusConnector {
    /// Create a new connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for ModbusConnector {
    async fn open(&self, profile: &ConnectionProfile, timeout: Duration) -> Result<Box<dyn Transport>> {
        let transport = match &profile.link {
            LinkParams::Network { host, port } => {
                ModbusTransport::connect_tcp(host, *port, profile.unit_id, timeout).await?
            }
            LinkParams::Serial { device, baud_rate } => {
                ModbusTransport::connect_rtu(device, *baud_rate, profile.unit_id, timeout)?
            }
        };
        Ok(Box::new(transport))
    }
}

/// A Modbus client context with a per-request timeout
pub struct ModbusTransport {
    ctx: Option<Context>,
    endpoint: String,
    timeout: Duration,
}

impl fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("open", &self.ctx.is_some())
            .finish()
    }
}

impl ModbusTransport {
    /// Connect to a Modbus TCP server
    pub async fn connect_tcp(host: &str, port: u16, unit_id: u8, timeout: Duration) -> Result<Self> {
        let endpoint = format!("tcp://{}:{}", host, port);
        debug!("Connecting to Modbus TCP server at {}", endpoint);

        let socket_addr = bounded(timeout, async {
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| TransportError::Connect(format!("Cannot resolve {}: {}", endpoint, e)))?
                .next()
                .ok_or_else(|| TransportError::Connect(format!("No address found for {}", endpoint)))
        })
        .await?;

        let ctx = bounded(timeout, async {
            tcp::connect_slave(socket_addr, Slave(unit_id))
                .await
                .map_err(|e| TransportError::Connect(format!("{}: {}", endpoint, e)))
        })
        .await?;

        info!("Connected to Modbus TCP server at {} (unit {})", endpoint, unit_id);
        Ok(Self {
            ctx: Some(ctx),
            endpoint,
            timeout,
        })
    }

    /// Open a serial line (8 data bits, 1 stop bit, no parity) and attach an RTU client
    #[cfg(feature = "serial")]
    pub fn connect_rtu(device: &str, baud_rate: u32, unit_id: u8, timeout: Duration) -> Result<Self> {
        let endpoint = format!("rtu://{}@{}", device, baud_rate);
        debug!("Opening Modbus RTU line {}", endpoint);

        let builder = tokio_serial::new(device, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(timeout);
        let port = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| TransportError::Connect(format!("{}: {}", endpoint, e)))?;

        info!("Opened Modbus RTU line {} (unit {})", endpoint, unit_id);
        Ok(Self {
            ctx: Some(rtu::attach_slave(port, Slave(unit_id))),
            endpoint,
            timeout,
        })
    }

    /// Serial support is compiled out
    #[cfg(not(feature = "serial"))]
    pub fn connect_rtu(device: &str, _baud_rate: u32, _unit_id: u8, _timeout: Duration) -> Result<Self> {
        Err(TransportError::Unsupported(format!(
            "serial link {} (built without the `serial` feature)",
            device
        )))
    }

    fn context(&mut self) -> Result<&mut Context> {
        self.ctx.as_mut().ok_or(TransportError::Closed)
    }
}

/// Exception responses and malformed frames surface from `tokio-modbus` as
/// `Other` / `InvalidData`; everything else is a broken stream.
fn classify(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::Other | ErrorKind::InvalidData | ErrorKind::InvalidInput => {
            TransportError::Protocol(err.to_string())
        }
        _ => TransportError::Io(err),
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn read_bits(&mut self, start: u16, count: u16) -> Result<Vec<bool>> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        let mut bits = bounded(timeout, async move { ctx.read_coils(start, count).await.map_err(classify) }).await?;
        bits.truncate(usize::from(count));
        Ok(bits)
    }

    async fn read_words(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        bounded(timeout, async move {
            ctx.read_holding_registers(start, count).await.map_err(classify)
        })
        .await
    }

    async fn write_bit(&mut self, address: u16, value: bool) -> Result<()> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        bounded(timeout, async move {
            ctx.write_single_coil(address, value).await.map_err(classify)
        })
        .await
    }

    async fn write_word(&mut self, address: u16, value: u16) -> Result<()> {
        let timeout = self.timeout;
        let ctx = self.context()?;
        bounded(timeout, async move {
            ctx.write_single_register(address, value).await.map_err(classify)
        })
        .await
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut ctx) = self.ctx.take() else {
            return Ok(());
        };
        let timeout = self.timeout;
        if let Err(e) = bounded(timeout, async move { ctx.disconnect().await.map_err(classify) }).await {
            warn!("Error while closing {}: {}", self.endpoint, e);
            return Err(e);
        }
        info!("Disconnected from {}", self.endpoint);
        Ok(())
    }
}
