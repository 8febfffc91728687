//! Mi Band Service - Background poller for Mi Smart Band fitness bands.
//!
//! Run with: `cargo run -p miband-service`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use miband_core::scan::{ScanOptions, scan_for_devices};
use miband_service::{ble_poller, cancel_on};
use miband_service::{Config, PollScheduler};

/// Mi Band Service - Poll fitness bands over Bluetooth LE.
#[derive(Parser, Debug)]
#[command(name = "miband-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every configured band until interrupted (default behavior).
    Run,

    /// Refresh every configured band once and print its sensors.
    Once,

    /// Scan for bands in range.
    Scan {
        /// Scan duration in seconds.
        #[arg(short, long, default_value_t = 10)]
        duration: u64,

        /// Show every peripheral, not only bands.
        #[arg(long)]
        all: bool,
    },

    /// Read the name, serial and firmware of a configured band.
    Identify {
        /// Device name or address from the configuration.
        device: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("miband_service=info".parse()?)
                .add_directive("miband_core=info".parse()?),
        )
        .init();

    match args.command {
        Some(Command::Scan { duration, all }) => scan(duration, all, args.json).await,
        Some(Command::Once) => once(&load_config(args.config.as_ref())?, args.json).await,
        Some(Command::Identify { ref device }) => {
            identify(&load_config(args.config.as_ref())?, device, args.json).await
        }
        Some(Command::Run) | None => run(&load_config(args.config.as_ref())?).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.validate()?;
    Ok(config)
}

async fn run(config: &Config) -> anyhow::Result<()> {
    if config.devices.is_empty() {
        anyhow::bail!(
            "no devices configured; add a [[devices]] entry to {}",
            miband_service::config::default_config_path().display()
        );
    }

    let shutdown = CancellationToken::new();
    let mut scheduler = PollScheduler::from_config(config, shutdown.clone())?;
    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    scheduler.shutdown().await;
    Ok(())
}

async fn once(config: &Config, json: bool) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let watcher = cancel_on(tokio::signal::ctrl_c(), shutdown.clone());
    let mut results = Vec::new();

    for device in &config.devices {
        if shutdown.is_cancelled() {
            break;
        }
        let poller = ble_poller(config, device, &shutdown)?;
        let outcome = poller.poll().await;
        results.push((poller.name().to_string(), outcome, poller.sensors()));
    }
    watcher.abort();

    if json {
        let value: Vec<_> = results
            .iter()
            .map(|(name, outcome, sensors)| {
                serde_json::json!({ "device": name, "outcome": outcome, "sensors": sensors })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for (name, outcome, sensors) in &results {
            println!("{} ({:?})", name, outcome);
            for sensor in sensors {
                println!("  {}", sensor);
            }
        }
    }
    Ok(())
}

async fn scan(duration: u64, all: bool, json: bool) -> anyhow::Result<()> {
    let mut options = ScanOptions::default().duration(Duration::from_secs(duration));
    if all {
        options = options.all_devices();
    }
    let devices = scan_for_devices(options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No bands found");
    } else {
        for device in &devices {
            println!(
                "{:<20} {:<40} {}",
                device.name.as_deref().unwrap_or("Unknown"),
                device.identifier,
                device.rssi.map_or_else(|| "-".to_string(), |r| format!("{} dBm", r))
            );
        }
    }
    Ok(())
}

async fn identify(config: &Config, device: &str, json: bool) -> anyhow::Result<()> {
    let device = config
        .device(device)
        .with_context(|| format!("device '{}' not in configuration", device))?;
    let shutdown = CancellationToken::new();
    let watcher = cancel_on(tokio::signal::ctrl_c(), shutdown.clone());
    let poller = ble_poller(config, device, &shutdown)?;
    let info = poller.session().identify().await;
    watcher.abort();
    let info = info?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Name:     {}", info.name);
        println!("Serial:   {}", info.serial);
        println!("Hardware: {}", info.hardware_revision);
        println!("Software: {}", info.software_revision);
    }
    Ok(())
}
