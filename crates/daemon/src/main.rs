//! brlusb daemon
//!
//! Opens the braille displays described in its configuration through usbfs
//! and reports their input. Runs in the foreground or under systemd.

mod config;
mod service;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, format_bytes, setup_logging};
use tokio::signal;
use tracing::{debug, error, info, warn};
use worker::spawn_usb_worker;

#[derive(Parser, Debug)]
#[command(name = "brlusbd")]
#[command(
    author,
    version,
    about = "brlusb daemon - drive braille displays over Linux usbfs"
)]
#[command(long_about = "
Talks to refreshable braille displays through the kernel's usbfs device
nodes and keeps their input endpoints monitored.

EXAMPLES:
    # Run in the foreground with the default config
    brlusbd

    # List USB host devices as JSON
    brlusbd --list-devices --json

    # Run as a systemd service
    brlusbd --service

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/brlusb/daemon.toml
    3. /etc/brlusb/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service
    #[arg(long)]
    service: bool,

    /// List USB host devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::DaemonConfig::default();
        let path = config::DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        config::DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("brlusb daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    // Listing needs no device profiles
    let profiles = if args.list_devices {
        Vec::new()
    } else {
        config.devices.clone()
    };

    let (usb_bridge, worker) = create_usb_bridge();
    let usb_worker_handle =
        spawn_usb_worker(worker, config.usb.clone(), profiles).context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(usb_bridge.clone(), args.json).await
    } else {
        let service_mode = args.service || config.daemon.service_mode;
        run(usb_bridge.clone(), service_mode).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = shutdown_usb_worker(usb_bridge).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {:#}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// List USB host devices and exit
async fn list_devices_mode(usb_bridge: UsbBridge, json: bool) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    usb_bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;
    let devices = rx.await.context("Failed to receive device list")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("Failed to encode device list")?
        );
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x}  class {:02x}  {}",
            device.vendor_id,
            device.product_id,
            device.class,
            device.node_path.display()
        );
        if let Some(control) = &device.control_path {
            println!("      sysfs: {}", control.display());
        }
    }

    Ok(())
}

/// Report device events until Ctrl+C; SIGHUP triggers a rescan
async fn run(usb_bridge: UsbBridge, service_mode: bool) -> Result<()> {
    let watchdog = if service_mode {
        info!("Running in service mode");
        if service::is_systemd() {
            info!("Running under systemd");
        }
        let watchdog = service::spawn_watchdog_task();
        service::notify_ready().context("Failed to notify systemd ready")?;
        service::notify_status("Running").context("Failed to send status to systemd")?;
        watchdog
    } else {
        info!("Running in the foreground, press Ctrl+C to stop");
        None
    };

    let events = usb_bridge.clone();
    let reporter = tokio::spawn(async move {
        let mut open = 0usize;
        while let Ok(event) = events.recv_event().await {
            match event {
                UsbEvent::DeviceOpened {
                    node_path,
                    vendor_id,
                    product_id,
                } => {
                    open += 1;
                    info!(
                        "Display {:04x}:{:04x} ready at {}",
                        vendor_id,
                        product_id,
                        node_path.display()
                    );
                    if service_mode {
                        let _ = service::notify_status(&format!("Running - {} display(s) open", open));
                    }
                }
                UsbEvent::InputReceived {
                    node_path,
                    endpoint,
                    data,
                } => {
                    if service_mode {
                        debug!("{} {:#04x}: {}", node_path.display(), endpoint, format_bytes(&data));
                    } else {
                        println!("{} {:#04x}: {}", node_path.display(), endpoint, format_bytes(&data));
                    }
                }
                UsbEvent::DeviceLost { node_path, reason } => {
                    open = open.saturating_sub(1);
                    warn!("Display lost: {}: {}", node_path.display(), reason);
                    if service_mode {
                        let _ = service::notify_status(&format!("Running - {} display(s) open", open));
                    }
                }
            }
        }
    });

    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
            _ = hangup.recv() => rescan(&usb_bridge).await,
        }
    }

    if service_mode {
        service::notify_stopping().context("Failed to notify systemd stopping")?;
    }
    if let Some(handle) = watchdog {
        handle.abort();
    }
    reporter.abort();

    Ok(())
}

/// Rediscover host devices and open any profile still missing its display
async fn rescan(usb_bridge: &UsbBridge) {
    info!("Received SIGHUP, rescanning USB devices");
    let (tx, rx) = tokio::sync::oneshot::channel();
    if let Err(e) = usb_bridge
        .send_command(UsbCommand::Rescan { response: tx })
        .await
    {
        error!("Failed to send Rescan command: {:#}", e);
        return;
    }
    match rx.await {
        Ok(Ok(count)) => info!("Rescan found {} USB device(s)", count),
        Ok(Err(e)) => warn!("Rescan failed: {}", e),
        Err(e) => error!("Rescan response lost: {}", e),
    }
}

/// Shutdown USB worker thread gracefully
async fn shutdown_usb_worker(usb_bridge: UsbBridge) -> Result<()> {
    usb_bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .context("Failed to send Shutdown command")?;
    Ok(())
}
