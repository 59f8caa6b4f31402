//! blepipe command line
//!
//! Scans for devices and runs command/response exchanges over a BLE
//! notification stream. Without the `ble-central` feature (or with
//! `--simulate`) it talks to an in-process loopback device that answers
//! every write with the same bytes, notified in 20-byte pieces.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use uuid::Uuid;

use blepipe::ble::simulated::{SimPeripheralConfig, SimTransport};
use blepipe::ble::transport::Transport;
use blepipe::scanner::Scanner;
use blepipe::{CharUuid, ClientConfig, DeviceAddress, ReadTimeout, StreamClient};

const LOOPBACK_ADDRESS: DeviceAddress = DeviceAddress::new([0xC6, 0xD8, 0x48, 0xB4, 0x61, 0x7C]);
const LOOPBACK_MTU: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEVICE_NAME: CharUuid = CharUuid::Standard(0x2A00);

#[derive(Parser)]
#[command(name = "blepipe")]
#[command(about = "Byte-stream access to BLE devices")]
struct Cli {
    /// JSON client configuration; the built-in service table if omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated loopback device even when hardware is available
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for devices
    Scan {
        /// Addresses to look for; every advertiser if none are given
        addresses: Vec<DeviceAddress>,
        /// Scan duration in milliseconds
        #[arg(short, long, default_value = "5000")]
        duration_ms: u64,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect, write one hex payload, print the response, disconnect
    Exchange {
        /// Hex payload, e.g. "aa0e0102030e"
        payload: String,
        /// Device address (overrides the configuration)
        #[arg(short, long)]
        address: Option<DeviceAddress>,
        /// Read exactly this many response bytes; otherwise read whatever
        /// arrived within the timeout
        #[arg(short = 'n', long)]
        read: Option<usize>,
        /// Response timeout in milliseconds
        #[arg(short, long, default_value = "1000")]
        timeout_ms: u64,
    },
}

fn load_config(path: Option<&PathBuf>, address: Option<DeviceAddress>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => ClientConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default_for(LOOPBACK_ADDRESS),
    };
    if let Some(address) = address {
        config.address = address;
    }
    Ok(config)
}

/// A simulated device at the configured address that echoes writes back
/// on the notify characteristic of the service written to.
fn loopback(config: &ClientConfig) -> Arc<SimTransport> {
    let transport = SimTransport::new();
    let mut device = SimPeripheralConfig::new(config.address)
        .with_local_name("blepipe-loopback")
        .with_service(CharUuid::Standard(0x1800).resolve(), &[DEVICE_NAME.resolve()]);
    let mut echo: Vec<(Uuid, Uuid)> = Vec::new();
    for (name, entry) in config.service_map().iter() {
        let (write, notify) = (entry.write.resolve(), entry.notify.resolve());
        device = device.with_service(entry.write.vendor_base().unwrap_or(write), &[write, notify]);
        echo.push((write, notify));
        info!("Loopback service {}: {} -> {}", name, write, notify);
    }

    let peripheral = transport.add_peripheral(device);
    peripheral.set_value(DEVICE_NAME.resolve(), b"blepipe-loopback".to_vec());
    peripheral.set_responder(Arc::new(move |written, data| {
        let Some((_, notify)) = echo.iter().find(|(write, _)| write == written) else {
            return Vec::new();
        };
        data.chunks(LOOPBACK_MTU)
            .map(|piece| (*notify, piece.to_vec()))
            .collect()
    }));
    transport
}

#[cfg(feature = "ble-central")]
async fn transport(config: &ClientConfig, simulate: bool) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = if simulate {
        loopback(config)
    } else {
        blepipe::ble::host::BtleplugTransport::new()
            .await
            .context("opening Bluetooth adapter")?
    };
    Ok(transport)
}

#[cfg(not(feature = "ble-central"))]
async fn transport(config: &ClientConfig, _simulate: bool) -> Result<Arc<dyn Transport>> {
    info!("Built without ble-central, using the loopback device");
    let transport: Arc<dyn Transport> = loopback(config);
    Ok(transport)
}

async fn scan(
    transport: Arc<dyn Transport>,
    addresses: &[DeviceAddress],
    duration: Duration,
    json: bool,
) -> Result<()> {
    let found = Scanner::new(transport).scan(addresses, duration).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    println!("Found {} device(s):", found.len());
    for device in found {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "  {} {} RSSI: {}",
            device.address,
            device.local_name.as_deref().unwrap_or("(unnamed)"),
            rssi
        );
        if let Some(data) = device.manufacturer_data {
            println!("    manufacturer data: {}", data);
        }
    }
    Ok(())
}

/// Gather `n` response bytes, polling the stream until `timeout` passes.
async fn collect(client: &StreamClient, n: usize, timeout: Duration) -> Vec<u8> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut response = Vec::with_capacity(n);
    loop {
        let budget = deadline.saturating_duration_since(tokio::time::Instant::now());
        let got = client
            .read_with(n - response.len(), ReadTimeout::Bounded(budget))
            .await;
        response.extend_from_slice(&got);
        if response.len() >= n || budget.is_zero() {
            return response;
        }
        tokio::time::sleep(POLL_INTERVAL.min(budget)).await;
    }
}

async fn exchange(
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    payload: &[u8],
    read: Option<usize>,
    timeout: Duration,
) -> Result<()> {
    let client = StreamClient::new(transport, config)?;
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", client.config().address))?;

    if let Ok(name) = client.session().io().read_string(DEVICE_NAME).await {
        println!("Connected to {} ({})", client.config().address, name);
    }

    let written = client.write(payload).await.context("writing payload")?;
    println!("> {} ({} bytes)", hex::encode(payload), written);

    let response = match read {
        Some(n) => collect(&client, n, timeout).await,
        None => {
            tokio::time::sleep(timeout).await;
            client.read_all()
        }
    };
    println!("< {} ({} bytes)", hex::encode(&response), response.len());
    if let Some(n) = read {
        if response.len() < n {
            println!("  short read: expected {} bytes", n);
        }
    }

    client.close().await.context("disconnecting")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            addresses,
            duration_ms,
            json,
        } => {
            let config = load_config(cli.config.as_ref(), None)?;
            let transport = transport(&config, cli.simulate).await?;
            scan(transport, &addresses, Duration::from_millis(duration_ms), json).await?;
        }
        Commands::Exchange {
            payload,
            address,
            read,
            timeout_ms,
        } => {
            let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = hex::decode(compact).context("payload must be hex")?;
            let config = load_config(cli.config.as_ref(), address)?;
            let transport = transport(&config, cli.simulate).await?;
            exchange(
                transport,
                config,
                &bytes,
                read,
                Duration::from_millis(timeout_ms),
            )
            .await?;
        }
    }

    Ok(())
}
