//! CoilFlow command-line front end
//!
//! `coilflow run` keeps the bridge up until interrupted; the other
//! subcommands connect, perform one operation and exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn, Instrument};

use coilflow_core::config::{Config, ConfigBuilder};
use coilflow_core::logging;
use coilflow_devices::{ConnectionProfile, DevicePoint, ModbusConnector};
use coilflow_engine::{
    Action, Bank, Bridge, BridgeEvent, BridgeSettings, ChangeLogSink, FanoutSink, JsonFileProfileStore,
    JsonLinesSink, RawValue, TracingSink,
};

/// Environment prefix for configuration overrides (`COILFLOW__BRIDGE__POLL_INTERVAL_MS`)
const ENV_PREFIX: &str = "COILFLOW";

/// CoilFlow device bridge
#[derive(Parser, Debug)]
#[command(name = "coilflow", version)]
#[command(about = "Poll and control a Modbus controller", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, default_value = "coilflow.toml")]
    config: PathBuf,

    /// Log filter, overriding the configured level
    #[arg(long)]
    log_level: Option<String>,

    /// How long one-shot commands wait for the link
    #[arg(long, default_value = "15")]
    wait_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep the bridge running and log every change until interrupted
    Run,
    /// Print the link state and every point's value as JSON
    Status,
    /// Toggle or set a point
    Control {
        /// Point name, e.g. `fan` or `light-red`
        point: DevicePoint,
        /// `toggle`, `on` or `off`
        action: Action,
    },
    /// Send a momentary pulse to a point
    Pulse {
        /// Point name
        point: DevicePoint,
    },
    /// Read raw bits or words
    Read {
        /// `bits` or `words`
        bank: Bank,
        /// First address
        start: u32,
        /// Number of values
        #[arg(default_value = "80")]
        count: u32,
    },
    /// Write one raw bit or word
    Write {
        /// `bits` or `words`
        bank: Bank,
        /// Address
        address: u32,
        /// `0`/`1`/`on`/`off` for bits, decimal or `0x` hex for words
        value: String,
    },
    /// Connect with a new profile and remember it
    Connect(ConnectArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Modbus TCP host
    #[arg(long, conflicts_with = "device")]
    host: Option<String>,

    /// Modbus TCP port
    #[arg(long, default_value = "502")]
    port: u16,

    /// Serial device for Modbus RTU
    #[arg(long)]
    device: Option<String>,

    /// Serial line speed
    #[arg(long, default_value = "9600")]
    baud_rate: u32,

    /// Unit (slave) id
    #[arg(long, default_value = "1")]
    unit_id: u8,
}

impl ConnectArgs {
    fn profile(&self) -> Result<ConnectionProfile> {
        let profile = match (&self.host, &self.device) {
            (Some(host), None) => ConnectionProfile::network(host.clone(), self.port),
            (None, Some(device)) => ConnectionProfile::serial(device.clone(), self.baud_rate),
            _ => bail!("pass either --host or --device"),
        };
        Ok(profile.with_unit_id(self.unit_id))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigBuilder::new()
        .with_config_file(&cli.config)
        .with_environment_prefix(ENV_PREFIX)
        .build()
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    logging::init_from_config(&logging_config)?;
    coilflow_devices::init()?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!(
        "{} ({}) using data directory {}",
        config.general.app_name, config.general.environment, config.general.data_dir
    );
    let span = logging::operation_span(command_name(&cli.command), "cli");
    run(cli, config).instrument(span).await
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Run => "run",
        Commands::Status => "status",
        Commands::Control { .. } => "control",
        Commands::Pulse { .. } => "pulse",
        Commands::Read { .. } => "read",
        Commands::Write { .. } => "write",
        Commands::Connect(_) => "connect",
        Commands::Config => "config",
    }
}

async fn start_bridge(config: &Config, auto_connect: bool) -> Result<Bridge> {
    let settings = BridgeSettings::try_from(&config.bridge)?;
    let default_profile = ConnectionProfile::try_from(&config.link)?;

    let mut sink = FanoutSink::default().with(Arc::new(TracingSink));
    if let Some(path) = config.change_log_path() {
        let history: Arc<dyn ChangeLogSink> = Arc::new(JsonLinesSink::new(path));
        sink = sink.with(history);
    }

    let bridge = Bridge::builder(Arc::new(ModbusConnector::new()))
        .settings(settings)
        .store(Arc::new(JsonFileProfileStore::new(config.profile_path())))
        .sink(Arc::new(sink))
        .default_profile(default_profile)
        .auto_connect(auto_connect)
        .start()
        .await?;
    Ok(bridge)
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let wait = Duration::from_secs(cli.wait_secs);

    if let Commands::Connect(args) = &cli.command {
        let bridge = start_bridge(&config, false).await?;
        let result = bridge.connect(args.profile()?).await;
        if result.is_ok() {
            println!("{}", serde_json::to_string_pretty(&bridge.status().await)?);
        }
        bridge.shutdown().await;
        return result.context("connecting with the new profile");
    }

    let bridge = start_bridge(&config, true).await?;
    if let Commands::Run = cli.command {
        return serve(bridge).await;
    }

    let result = one_shot(&bridge, cli.command, wait).await;
    bridge.shutdown().await;
    result
}

async fn one_shot(bridge: &Bridge, command: Commands, wait: Duration) -> Result<()> {
    bridge
        .wait_connected(wait)
        .await
        .with_context(|| format!("controller not reachable within {:?}", wait))?;

    match command {
        Commands::Status => {
            bridge.poll_now().await?;
            println!("{}", serde_json::to_string_pretty(&bridge.status().await)?);
        }
        Commands::Control { point, action } => {
            bridge.control(point, action).await?;
            println!("{} {:?}", point, action);
        }
        Commands::Pulse { point } => {
            bridge.momentary_pulse(point).await?;
            // Let the de-assert run before shutdown cancels it
            tokio::time::sleep(bridge.settings().pulse_duration * 2).await;
            println!("{} pulsed", point);
        }
        Commands::Read { bank, start, count } => {
            let values = bridge.read_raw(bank, start, count).await?;
            println!("{}", serde_json::to_string(&values)?);
        }
        Commands::Write { bank, address, value } => {
            let value = RawValue::parse(bank, &value)?;
            bridge.write_raw(bank, address, value).await?;
            println!("wrote {:?} to {} {}", value, bank, address);
        }
        Commands::Run | Commands::Connect(_) | Commands::Config => {}
    }
    Ok(())
}

async fn serve(bridge: Bridge) -> Result<()> {
    let mut events = bridge.subscribe();
    info!("CoilFlow {} running, press Ctrl-C to stop", env!("CARGO_PKG_VERSION"));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                }
                break;
            }
            event = events.recv() => match event {
                Ok(BridgeEvent::LinkChanged(state)) => info!("Link {}", state),
                Ok(BridgeEvent::PointChanged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} bridge events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    bridge.shutdown().await;
    Ok(())
}
