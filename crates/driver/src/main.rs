//! hid-class-driver
//!
//! Runs the USB HID class driver against libusb: a host daemon thread owns
//! the library, a driver thread enumerates the first matching HID device and
//! polls it, and the Tokio runtime prints driver events and handles Ctrl+C.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{DriverEvent, EventSubscriber, ReadySignal, create_event_bridge, setup_logging};
use driver::config::{self, DriverConfig};
use driver::spawn_class_driver;
use host::{RusbHost, RusbLibrary, spawn_host_daemon};
use protocol::hex_dump;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Driver events buffered between the driver thread and the printer
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Interval at which a blocked host pump is woken during shutdown
const WAKE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "hid-class-driver")]
#[command(
    author,
    version,
    about = "USB HID host class driver - enumerate and poll a HID device"
)]
#[command(long_about = "
Waits for a USB HID device, enumerates it, fetches its HID report descriptor
and prints the input reports read from its interrupt IN endpoint.

EXAMPLES:
    # Run with default config
    hid-class-driver

    # Only accept one vendor (set usb.filters in the config file)
    hid-class-driver --config ~/hid.toml

    # List USB devices without starting the driver
    hid-class-driver --list-devices --json

    # Show every input report
    hid-class-driver --log-level trace

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rust-usb-hid-host/driver.toml
    3. /etc/rust-usb-hid-host/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
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
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DriverConfig::load(Some(config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("rust-usb-hid-host driver v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode(&config, args.json);
    }

    run(config).await
}

/// List USB devices and exit
fn list_devices_mode(config: &DriverConfig, json: bool) -> Result<()> {
    let library = RusbLibrary::install().context("Failed to initialize libusb")?;
    let devices = library
        .list_devices(&config.usb.filters)
        .context("Failed to list USB devices")?;

    if json {
        let out = serde_json::to_string_pretty(&devices).context("Failed to encode device list")?;
        println!("{}", out);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {} {}{}",
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product"),
            if device.allowed { "" } else { " (filtered)" }
        );
        println!(
            "      Bus {:03} Device {:03} Speed: {}",
            device.bus, device.address, device.speed
        );
        if !device.hid_interfaces.is_empty() {
            println!("      HID interfaces: {:?}", device.hid_interfaces);
        }
        println!();
    }
    Ok(())
}

async fn run(config: DriverConfig) -> Result<()> {
    let signal_handle = ReadySignal::new();
    let (installed_tx, installed_rx) = crossbeam_channel::bounded(1);
    let daemon = spawn_host_daemon(signal_handle.clone(), installed_tx)
        .context("Failed to spawn host daemon thread")?;

    let library: RusbLibrary = match tokio::task::spawn_blocking(move || installed_rx.recv())
        .await
        .context("Host daemon handshake failed")?
    {
        Ok(library) => library,
        Err(_) => {
            let reason = match daemon.join() {
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(())) => "daemon exited".to_string(),
                Err(_) => "daemon panicked".to_string(),
            };
            return Err(anyhow!("Host library not installed: {}", reason));
        }
    };

    let (publisher, subscriber) = create_event_bridge(EVENT_CHANNEL_CAPACITY);
    let printer = tokio::spawn(print_events(subscriber));

    let shutdown = Arc::new(AtomicBool::new(false));
    let connect = {
        let library = library.clone();
        let filters = config.usb.filters.clone();
        move || Ok(RusbHost::new(library, filters))
    };
    let driver_thread = spawn_class_driver(
        signal_handle,
        config,
        connect,
        Some(publisher),
        shutdown.clone(),
    )
    .context("Failed to spawn class driver thread")?;

    info!("Waiting for a HID device, press Ctrl+C to stop");

    let mut joined = tokio::task::spawn_blocking(move || driver_thread.join());
    let joined = tokio::select! {
        joined = &mut joined => joined,
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            shutdown.store(true, Ordering::SeqCst);

            // The driver may be blocked in the host pump
            let waker = library.clone();
            let wake_task = tokio::spawn(async move {
                loop {
                    waker.wake();
                    tokio::time::sleep(WAKE_INTERVAL).await;
                }
            });
            let joined = (&mut joined).await;
            wake_task.abort();
            joined
        }
    };

    let result = match joined.context("Class driver join task failed")? {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!(e).context("Class driver failed")),
        Err(_) => Err(anyhow!("Class driver thread panicked")),
    };

    info!("Shutting down host library...");
    library.request_shutdown();
    drop(library);
    match tokio::task::spawn_blocking(move || daemon.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Host daemon error: {}", e),
        Ok(Err(_)) => error!("Host daemon thread panicked"),
        Err(e) => error!("Host daemon join task failed: {}", e),
    }

    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    result
}

/// Print driver events until the driver thread drops its publisher
async fn print_events(subscriber: EventSubscriber) {
    while let Ok(event) = subscriber.recv().await {
        match event {
            DriverEvent::DeviceOpened {
                address,
                vendor_id,
                product_id,
                speed,
                manufacturer,
                product,
                serial_number,
            } => {
                println!(
                    "Device {} opened: {:04x}:{:04x} {} {} ({} speed)",
                    address,
                    vendor_id,
                    product_id,
                    manufacturer.as_deref().unwrap_or("Unknown Manufacturer"),
                    product.as_deref().unwrap_or("Unknown Product"),
                    speed
                );
                if let Some(serial) = serial_number {
                    println!("  Serial: {}", serial);
                }
            }
            DriverEvent::InterfaceClaimed {
                interface,
                endpoint_in,
                endpoint_out,
            } => {
                println!(
                    "Interface {} claimed (IN {:?}, OUT {:?})",
                    interface, endpoint_in, endpoint_out
                );
            }
            DriverEvent::ReportDescriptor {
                interface,
                descriptor,
                kind,
            } => {
                println!(
                    "Report descriptor of interface {} ({} bytes, {}):",
                    interface,
                    descriptor.len(),
                    kind.label()
                );
                println!("  {}", hex_dump(&descriptor));
            }
            DriverEvent::InputReport { endpoint, data } => {
                println!("[{:#04x}] {}", endpoint, hex_dump(&data));
            }
            DriverEvent::DeviceClosed { address } => {
                println!("Device {} closed", address);
            }
        }
    }
}
