//! tailsd command-line entry point.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use clap::Subcommand;
use tailsd::Config;
use tailsd::Daemon;
use tailsd::config::LoggingConfig;
use tailsd::console::LogConsole;
use tailsd::format_config_error;
use tailsd::store::DeviceStore;
use tailsd::transport::sim::SimTransport;
use tracing::info;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_CONFIG: &str = "tailsd.toml";

/// Fleet manager for TouchyTails peripherals
#[derive(Parser, Debug)]
#[command(name = "tailsd")]
#[command(version)]
struct Cli {
    /// Configuration file path [default: tailsd.toml]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run,

    /// Run one discovery pass and register the device found
    Scan,

    /// Print the persisted device list
    Devices,

    /// Validate the configuration file
    CheckConfig,
}

/// Load the config file. A missing default file means all defaults; a missing explicit
/// file is an error.
fn load_config(path: Option<&Path>) -> anyhow::Result<(PathBuf, Config)> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };

    if !explicit && !path.exists() {
        return Ok((path, Config::default()));
    }

    match Config::from_file(&path) {
        Ok(config) => Ok((path, config)),
        Err(e) => {
            eprintln!("{}", format_config_error(&e));
            anyhow::bail!("invalid configuration in {}", path.display())
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let mut targets = Targets::new().with_default(LevelFilter::from(config.level));
    for (target, level) in &config.overrides {
        targets = targets.with_target(target.clone(), LevelFilter::from(*level));
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(targets)
        .init();
}

fn simulator(config: &Config) -> SimTransport {
    let sim = SimTransport::new();
    for peripheral in &config.simulator.peripherals {
        sim.add_peripheral(&peripheral.address, &peripheral.name);
    }
    if config.simulator.peripherals.is_empty() {
        warn!("No radio transport available and no simulated peripherals configured");
    } else {
        info!(
            "Simulating {} peripherals",
            config.simulator.peripherals.len()
        );
    }
    sim
}

fn daemon(config: &Config) -> Daemon {
    let sim = simulator(config);
    Daemon::new(
        config,
        Arc::new(sim.clone()),
        Arc::new(sim),
        Arc::new(LogConsole),
    )
}

async fn run(path: &Path, config: Config) -> anyhow::Result<()> {
    info!("tailsd {} starting", env!("CARGO_PKG_VERSION"));
    info!("Loaded config from: {}", path.display());

    daemon(&config)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn scan(config: Config) -> anyhow::Result<()> {
    let ctx = daemon(&config).context();
    ctx.registry.load(ctx.console.as_ref());

    let outcome = ctx.scan_and_adopt().await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn devices(config: &Config) -> anyhow::Result<()> {
    let store = DeviceStore::new(&config.storage.devices_path);
    let records = store
        .load()
        .with_context(|| format!("Failed to load {}", store.path().display()))?;

    if records.is_empty() {
        println!("No devices in {}", store.path().display());
        return Ok(());
    }

    for record in records {
        let event = if record.event.is_empty() {
            "-"
        } else {
            record.event.as_str()
        };
        println!(
            "{:<36}  {:<16}  {:<8}  {}",
            record.id,
            record.name,
            if record.enabled { "enabled" } else { "disabled" },
            event
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (path, config) = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            println!("{}: OK", path.display());
            Ok(())
        }
        Command::Devices => devices(&config),
        Command::Scan => {
            init_logging(&config.logging);
            scan(config).await
        }
        Command::Run => {
            init_logging(&config.logging);
            run(&path, config).await
        }
    }
}
