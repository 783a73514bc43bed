//! Volstore object server binary
//!
//! Serves objects stored on one or more mounted POSIX volumes.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volstore_common::Config;
use volstore_common::config::DeviceConfig;
use volstore_server::{AppState, router};
use volstore_storage::VolumeRegistry;

#[derive(Parser, Debug)]
#[command(name = "volstore-server")]
#[command(about = "Volstore object server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/volstore/server.toml")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Device to serve, as NAME=PATH (repeatable, replaces configured devices)
    #[arg(long = "device", value_parser = parse_device)]
    devices: Vec<DeviceConfig>,

    /// Do not reserve space before writing objects
    #[arg(long)]
    no_preallocate: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_device(s: &str) -> std::result::Result<DeviceConfig, String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {s}"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got {s}"));
    }
    Ok(DeviceConfig {
        name: name.to_string(),
        path: PathBuf::from(path),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // CLI takes precedence over the config file
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if !args.devices.is_empty() {
        config.storage.devices = args.devices;
    }
    if args.no_preallocate {
        config.storage.preallocate = false;
    }
    if args.log_level != "info" {
        config.logging.level = args.log_level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting volstore object server");
    info!("Config file: {}", args.config.display());

    config.validate()?;
    if config.storage.devices.is_empty() {
        error!(
            "No devices specified. Use --device or configure in {}",
            args.config.display()
        );
        std::process::exit(1);
    }

    let registry = VolumeRegistry::from_config(&config.storage)?;
    for device in &config.storage.devices {
        info!("Device {} mounted at {}", device.name, device.path.display());
    }
    info!("Preallocation: {}", config.storage.preallocate);

    let state = Arc::new(AppState { registry });
    let app = router(state, config.server.max_object_size);

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    info!("Listening on {}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
