//! Discovery scan for a set of addresses
//!
//! Scans until every wanted address has been seen or the duration is up.
//! Transports scan in bounded windows and report a scan timeout at the end
//! of each; the scanner starts a new window whenever that happens before
//! its own deadline.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::advertisement::Advertisement;
use crate::ble::transport::{LinkEventSink, ScanParams, TimeoutSource, Transport};
use crate::ble::BleError;

/// One advertiser seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FoundDevice {
    pub address: DeviceAddress,
    pub rssi: Option<i16>,
    pub local_name: Option<String>,
    /// Manufacturer-specific data, hex encoded.
    pub manufacturer_data: Option<String>,
    /// The raw advertising payload.
    #[serde(with = "hex_payload")]
    pub data: Vec<u8>,
}

impl From<&Advertisement> for FoundDevice {
    fn from(advertisement: &Advertisement) -> Self {
        Self {
            address: advertisement.address,
            rssi: advertisement.rssi,
            local_name: advertisement.local_name(),
            manufacturer_data: advertisement.manufacturer_data().map(hex::encode),
            data: advertisement.data.clone(),
        }
    }
}

mod hex_payload {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}

enum Progress {
    AllFound,
    WindowClosed,
}

struct Collector {
    filter: ScanParams,
    found: Mutex<Vec<FoundDevice>>,
    progress: mpsc::UnboundedSender<Progress>,
}

impl LinkEventSink for Collector {
    fn on_advertisement(&self, advertisement: &Advertisement) {
        if !self.filter.admits(&advertisement.address) {
            return;
        }
        let mut found = self.found.lock().unwrap_or_else(PoisonError::into_inner);
        if found.iter().any(|d| d.address == advertisement.address) {
            return;
        }
        info!(
            "Device found: {} (rssi {:?})",
            advertisement.address, advertisement.rssi
        );
        found.push(FoundDevice::from(advertisement));
        if !self.filter.filter.is_empty() && found.len() == self.filter.filter.len() {
            let _ = self.progress.send(Progress::AllFound);
        }
    }

    fn on_timeout(&self, source: TimeoutSource) {
        if source == TimeoutSource::Scan {
            let _ = self.progress.send(Progress::WindowClosed);
        }
    }
}

/// Unsubscribes when dropped.
struct Subscription<'a> {
    transport: &'a dyn Transport,
    id: Uuid,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.id);
    }
}

pub struct Scanner {
    transport: Arc<dyn Transport>,
    window: Option<Duration>,
}

impl Scanner {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            window: None,
        }
    }

    /// Ask the transport for scan windows of at most `window`.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    fn params(&self, addresses: &[DeviceAddress], remaining: Duration) -> ScanParams {
        let duration = match self.window {
            Some(window) => window.min(remaining),
            None => remaining,
        };
        ScanParams::new(addresses.to_vec(), duration)
    }

    /// Scan for `addresses` (every advertiser if empty) for up to
    /// `duration`. Returns each device seen, once, in discovery order.
    pub async fn scan(
        &self,
        addresses: &[DeviceAddress],
        duration: Duration,
    ) -> Result<Vec<FoundDevice>, BleError> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let collector = Arc::new(Collector {
            filter: ScanParams::new(addresses.to_vec(), duration),
            found: Mutex::new(Vec::new()),
            progress: progress_tx,
        });
        let _subscription = Subscription {
            transport: self.transport.as_ref(),
            id: self.transport.subscribe_link(collector.clone()),
        };

        let deadline = Instant::now() + duration;
        info!("Scan start for {} address(es)", addresses.len());
        self.transport.start_scan(&self.params(addresses, duration)).await?;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                progress = progress_rx.recv() => match progress {
                    Some(Progress::AllFound) | None => break,
                    Some(Progress::WindowClosed) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        debug!("Scan window closed, restarting");
                        let params = self.params(addresses, deadline - now);
                        if let Err(e) = self.transport.start_scan(&params).await {
                            warn!("Could not restart scan: {}", e);
                            break;
                        }
                    }
                },
            }
        }

        if let Err(e) = self.transport.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }
        let found = collector
            .found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        info!("Scan finished, {} device(s) found", found.len());
        Ok(found)
    }
}
