use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use blebridge::core::bluetooth::{ScanTransport, Transport, UUID_BATTERY_LEVEL};
use blebridge::{AppConfig, CharacteristicRef, Scanner, Session, logging};

#[derive(Parser)]
#[command(name = "blebridge")]
#[command(about = "Scan for and talk to BLE peripherals", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding blebridge.json
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
    #[arg(long, default_value = "info")]
    log_level: log::Level,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan and print every advertiser seen
    Scan {
        #[arg(default_value_t = 5)]
        secs: u64,
    },
    /// Connect, dump the GATT tree and read the battery level if present
    Connect { address: String },
}

#[cfg(feature = "bluest")]
async fn backends() -> Result<(Arc<dyn Transport>, Arc<dyn ScanTransport>)> {
    use blebridge::core::bluetooth::backends::delegate::{DelegateScanner, DelegateTransport, DeviceRegistry};

    let registry = DeviceRegistry::new();
    let adapter = bluest::Adapter::default()
        .await
        .context("Bluetooth adapter not found")?;
    adapter.wait_available().await?;
    let transport = DelegateTransport::new(adapter.clone(), registry.clone());
    let scanner = DelegateScanner::new(adapter, registry);
    Ok((Arc::new(transport), Arc::new(scanner)))
}

#[cfg(not(feature = "bluest"))]
async fn backends() -> Result<(Arc<dyn Transport>, Arc<dyn ScanTransport>)> {
    use blebridge::core::bluetooth::backends::fake::{FakeScanner, FakeTransport};

    warn!("Built without a platform stack, using the in-memory peripheral.");
    Ok((Arc::new(FakeTransport::demo()), Arc::new(FakeScanner::demo())))
}

async fn scan(scanner: &mut Scanner, secs: u64) -> Result<()> {
    scanner
        .start_scan(|device, advertisement| {
            info!(
                "{} {} rssi={:?} services={:?}",
                device.address,
                device.display_name(),
                device.rssi,
                advertisement.service_uuids
            );
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(secs)).await;
    scanner.stop_scan().await?;

    for (device, advertisement) in scanner.get_discovered_devices() {
        println!(
            "{}\t{}\t{:?}\t{}",
            device.address,
            device.display_name(),
            device.rssi,
            serde_json::to_string(&advertisement)?
        );
    }
    Ok(())
}

async fn connect(session: &Session, address: &str, timeout: Duration) -> Result<()> {
    session.set_disconnected_callback(|address| warn!("{} dropped the connection", address));
    session
        .connect(address, timeout)
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;

    let tree = session.get_services().await?;
    for service in tree.services() {
        println!("service {} (0x{:04x})", service.uuid, service.handle);
        for characteristic in &service.characteristics {
            println!(
                "  characteristic {} (0x{:04x}) {:?}",
                characteristic.uuid, characteristic.handle, characteristic.properties
            );
        }
    }

    if tree.characteristics().any(|c| c.uuid == UUID_BATTERY_LEVEL) {
        let level = session
            .read_characteristic(CharacteristicRef::Uuid(UUID_BATTERY_LEVEL))
            .await?;
        println!("battery level: {:?}%", level.first());
    }

    session.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level);

    let config = AppConfig::load_config(&cli.config_dir).await?;
    let (transport, scan_transport) = backends().await?;
    let mut scanner = Scanner::new(scan_transport, config.scanner.clone());

    match cli.command {
        Commands::Scan { secs } => scan(&mut scanner, secs).await,
        Commands::Connect { address } => {
            let session = Session::new(transport, config.session.clone());
            let timeout = session.config().connect_timeout();
            // Delegate stacks can only open devices they have seen advertise.
            if cfg!(feature = "bluest") {
                match scanner.find_device_by_address(&address, timeout).await? {
                    Some((device, _)) => info!("Found {} ({:?} dBm)", device.display_name(), device.rssi),
                    None => warn!("{} was not seen advertising, trying to connect anyway", address),
                }
            }
            connect(&session, &address, timeout).await
        }
    }
}
