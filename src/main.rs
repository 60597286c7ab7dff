//! Tally bridge CLI - headless forwarder from a vMix mixer to a relay.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tally_bridge::env::Environment;
use tally_bridge::{Bridge, BridgeSettings, Config, RelayClient, VmixClient, VmixEvent, VmixOptions};
use tokio_util::sync::CancellationToken;

/// How long `probe` waits for the first tally snapshot.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "tally-bridge")]
#[command(version)]
#[command(about = "Forward live vMix tally state to a ReturnFeed relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to vMix and the relay and forward tally until Ctrl-C
    Run {
        #[command(flatten)]
        vmix: VmixArgs,
        /// Relay WebSocket URL
        #[arg(long)]
        relay_url: Option<String>,
        /// Relay session id
        #[arg(long)]
        session_id: Option<String>,
        /// Keep retrying unreachable endpoints
        #[arg(long)]
        auto_connect: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
    /// Connect to vMix, print the first tally snapshot and exit
    Probe {
        #[command(flatten)]
        vmix: VmixArgs,
    },
}

#[derive(clap::Args)]
struct VmixArgs {
    /// vMix host
    #[arg(long)]
    vmix_host: Option<String>,
    /// vMix TCP API port
    #[arg(long)]
    vmix_port: Option<u16>,
}

impl VmixArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.vmix_host {
            config.vmix_host = host;
        }
        if let Some(port) = self.vmix_port {
            config.vmix_port = port;
        }
    }
}

fn init_logging(environment: Environment) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(environment.default_log_filter()),
    );
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("TALLY_BRIDGE_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}; logging to stderr"),
        }
    }

    builder.init();
}

fn vmix_client(config: &Config) -> VmixClient {
    VmixClient::new(VmixOptions {
        http_port: config.vmix_http_port,
        ..VmixOptions::default()
    })
}

async fn run(config: Config) -> Result<()> {
    let settings = BridgeSettings::from(&config);
    let bridge = Bridge::new(vmix_client(&config), RelayClient::default());

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("[Bridge] Ctrl-C received, shutting down"),
            Err(e) => log::error!("[Bridge] Cannot listen for Ctrl-C: {}", e),
        }
        on_signal.cancel();
    });

    log::info!("Tally bridge v{} starting", env!("CARGO_PKG_VERSION"));
    bridge.run(&settings, &shutdown).await
}

async fn probe(config: Config) -> Result<()> {
    let client = vmix_client(&config);
    let mut events = client.subscribe();

    client
        .connect(&config.vmix_host, config.vmix_port)
        .await
        .with_context(|| format!("failed to connect to vMix at {}:{}", config.vmix_host, config.vmix_port))?;
    println!("Connected to vMix at {}:{}", config.vmix_host, config.vmix_port);

    let first_tally = tokio::time::timeout(PROBE_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(VmixEvent::Tally(tally)) => return Some(tally),
                Ok(VmixEvent::Inputs(inputs)) => {
                    println!("{} inputs (vMix {})", inputs.inputs.len(), inputs.device_version);
                }
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;

    client.disconnect().await;

    match first_tally {
        Ok(Some(tally)) => {
            println!("{}", serde_json::to_string_pretty(&tally)?);
            Ok(())
        }
        Ok(None) | Err(_) => anyhow::bail!("no tally received within {}s", PROBE_TIMEOUT.as_secs()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::current();
    init_logging(environment);

    let cli = Cli::parse();
    let mut config = Config::load()?;
    log::debug!("Environment: {}", environment);

    match cli.command {
        Commands::Run {
            vmix,
            relay_url,
            session_id,
            auto_connect,
        } => {
            vmix.apply(&mut config);
            if let Some(url) = relay_url {
                config.relay_url = url;
            }
            if let Some(session_id) = session_id {
                config.session_id = session_id;
            }
            config.auto_connect |= auto_connect;
            run(config).await?;
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
                println!("Saved to {}", Config::config_dir()?.join("config.json").display());
            }
        }
        Commands::Probe { vmix } => {
            vmix.apply(&mut config);
            probe(config).await?;
        }
    }

    Ok(())
}
