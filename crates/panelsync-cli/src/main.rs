//! PanelSync daemon
//!
//! Tracks PCPanel devices, darkens them around suspend and shutdown,
//! restores their lighting on resume, and mirrors their presence to an MQTT
//! broker.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use panelsync_core::config::Config;
use panelsync_core::error::Error as CoreError;
use panelsync_core::event::SharedEventBus;
use panelsync_core::logging;
use panelsync_core::utils::{spawn_and_log, with_timeout};
use panelsync_devices::{DeviceRegistry, NullWatcher};
use panelsync_engine::{
    select_source, shutdown_source, CoordinatorTimings, PowerEventCoordinator, PowerEventSink,
};
use panelsync_mqtt::{MessagingGateway, RumqttConnector, StatusMirror};

/// Upper bound for darkening devices and leaving the broker on exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "panelsync")]
#[command(
    author,
    version,
    about = "PanelSync - keep USB control panels in step with power state and MQTT"
)]
#[command(long_about = "
Tracks PCPanel Mini, Pro and RGB devices, switches them dark before the
system suspends or shuts down, restores their lighting after resume, and
publishes retained device status to an MQTT broker.

EXAMPLES:
    # Run with defaults and PANELSYNC__* environment overrides
    panelsync

    # Run with a configuration file
    panelsync --config /etc/panelsync/panelsync.toml

    # Show the effective configuration and exit
    panelsync --config panelsync.toml --print-config

Send SIGHUP to reload the configuration file.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_ref()).context("Failed to load configuration")?;

    if args.print_config {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    match args.log_level.as_deref() {
        Some(level) => logging::init_with_filter(level),
        None => logging::init_from_config(&config.logging),
    }
    .context("Failed to setup logging")?;

    info!("PanelSync v{}", env!("CARGO_PKG_VERSION"));
    panelsync_devices::init()?;
    panelsync_engine::init()?;
    panelsync_mqtt::init()?;

    run(args, config).await
}

async fn run(args: Args, config: Config) -> Result<()> {
    let bus = SharedEventBus::new();

    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(NullWatcher),
        bus.clone(),
        &config.devices,
    ));
    let _hotplug = registry
        .start_watching()
        .context("Failed to start hardware watcher")?;
    let _registry_settings = registry.spawn_settings_listener()?;
    if config.devices.rescan_on_start {
        let added = registry.rescan();
        info!("Found {} devices", added);
    }

    let gateway = Arc::new(MessagingGateway::new(
        Arc::new(RumqttConnector::new()),
        bus.clone(),
        &config.topics,
    ));
    let _gateway_settings = gateway.spawn_settings_listener()?;
    let mirror = StatusMirror::new(gateway.clone(), registry.clone()).spawn(&bus)?;
    let connect = {
        let gateway = gateway.clone();
        let settings = config.mqtt.clone();
        spawn_and_log("mqtt-connect", async move { gateway.apply_settings(settings).await })
    };

    let coordinator = PowerEventCoordinator::start(
        registry.clone(),
        &bus,
        CoordinatorTimings::from(&config.power),
    )?;

    let power = select_source(&config.power);
    if let Err(e) = power.start(PowerEventSink::new(bus.clone())) {
        warn!("Power events unavailable from {}: {}", power.name(), e);
    }

    wait_for_shutdown(&args, &bus).await?;

    info!("Shutting down");
    shutdown_source(power).await;
    connect.abort();
    let stopped = with_timeout(SHUTDOWN_TIMEOUT, async {
        coordinator.on_shutdown().await;
        mirror.abort();
        gateway.shutdown().await;
        Ok::<(), CoreError>(())
    })
    .await;
    if let Err(e) = stopped {
        error!("Shutdown incomplete: {}", e);
    }
    info!("PanelSync stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(args: &Args, bus: &SharedEventBus) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to wait for Ctrl-C")?;
                return Ok(());
            }
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => reload(args, bus),
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_args: &Args, _bus: &SharedEventBus) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")
}

#[cfg(unix)]
fn reload(args: &Args, bus: &SharedEventBus) {
    use panelsync_core::config::SettingsChanged;

    match Config::load(args.config.as_ref()) {
        Ok(config) => {
            info!("Configuration reloaded");
            bus.emit(SettingsChanged::new(config));
        }
        Err(e) => error!("Failed to reload configuration: {}", e),
    }
}
