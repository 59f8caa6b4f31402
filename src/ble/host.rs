//! Host BLE transport backed by btleplug
//!
//! Drives the platform Bluetooth stack (BlueZ, CoreBluetooth, WinRT) and
//! translates its adapter events into the [`Transport`] event contract.
//! Enabled with the `ble-central` feature.
//!
//! btleplug reports neither raw advertising data nor HCI disconnect reasons.
//! Advertisements are rebuilt from the peripheral's properties, and a link
//! lost without a local request is reported as `RemoteUserTerminated`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::address::DeviceAddress;
use super::advertisement::{self, Advertisement};
use super::transport::{
    ConnectionHandle, DisconnectReason, GattService, NotificationChunk, ScanParams, SinkRegistry,
    TimeoutSource, Transport,
};
use super::BleError;

fn rejected(error: btleplug::Error) -> BleError {
    BleError::Rejected(error.to_string())
}

struct Link {
    peripheral: Peripheral,
    address: DeviceAddress,
    notifications: JoinHandle<()>,
}

struct HostInner {
    adapter: Adapter,
    sinks: SinkRegistry,
    links: Mutex<HashMap<ConnectionHandle, Link>>,
    next_handle: AtomicU16,
    scan_filter: Mutex<Option<ScanParams>>,
    scan_epoch: AtomicU64,
}

impl HostInner {
    fn links(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, Link>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn scan_filter(&self) -> MutexGuard<'_, Option<ScanParams>> {
        self.scan_filter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peripheral(&self, handle: ConnectionHandle) -> Result<Peripheral, BleError> {
        self.links()
            .get(&handle)
            .map(|link| link.peripheral.clone())
            .ok_or(BleError::NotConnected)
    }

    async fn report_advertisement(&self, id: &PeripheralId) {
        let Ok(peripheral) = self.adapter.peripheral(id).await else {
            return;
        };
        let Ok(Some(properties)) = peripheral.properties().await else {
            return;
        };
        let address = DeviceAddress::new(properties.address.into_inner());
        let admitted = self
            .scan_filter()
            .as_ref()
            .is_some_and(|params| params.admits(&address));
        if !admitted {
            return;
        }
        // Company identifier goes first, little endian, as on air.
        let manufacturer = properties
            .manufacturer_data
            .iter()
            .next()
            .map(|(company, data)| {
                let mut record = company.to_le_bytes().to_vec();
                record.extend_from_slice(data);
                record
            });
        self.sinks.advertisement(&Advertisement {
            address,
            rssi: properties.rssi,
            data: advertisement::encode(properties.local_name.as_deref(), manufacturer.as_deref()),
        });
    }

    fn link_lost(&self, id: &PeripheralId) {
        let lost: Vec<(ConnectionHandle, Link)> = {
            let mut links = self.links();
            let handles: Vec<ConnectionHandle> = links
                .iter()
                .filter(|(_, link)| link.peripheral.id() == *id)
                .map(|(handle, _)| *handle)
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| links.remove(&handle).map(|link| (handle, link)))
                .collect()
        };
        for (handle, link) in lost {
            link.notifications.abort();
            info!("Link {} to {} lost", handle, link.address);
            self.sinks
                .disconnected(handle, DisconnectReason::RemoteUserTerminated);
        }
    }
}

/// [`Transport`] over the host's Bluetooth adapter.
pub struct BtleplugTransport {
    inner: Arc<HostInner>,
    events: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Use the first adapter the platform reports.
    pub async fn new() -> Result<Arc<Self>, BleError> {
        let manager = Manager::new().await.map_err(rejected)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(rejected)?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::Rejected("no Bluetooth adapter found".to_string()))?;
        Self::with_adapter(adapter).await
    }

    pub async fn with_adapter(adapter: Adapter) -> Result<Arc<Self>, BleError> {
        let mut events = adapter.events().await.map_err(rejected)?;
        let inner = Arc::new(HostInner {
            adapter,
            sinks: SinkRegistry::new(),
            links: Mutex::new(HashMap::new()),
            next_handle: AtomicU16::new(0),
            scan_filter: Mutex::new(None),
            scan_epoch: AtomicU64::new(0),
        });

        let pump = Arc::clone(&inner);
        let events = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        pump.report_advertisement(&id).await;
                    }
                    CentralEvent::DeviceDisconnected(id) => pump.link_lost(&id),
                    other => debug!("Unhandled adapter event: {:?}", other),
                }
            }
        });

        Ok(Arc::new(Self { inner, events }))
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, BleError> {
        for peripheral in self.inner.adapter.peripherals().await.map_err(rejected)? {
            if peripheral.address().into_inner() == address.octets() {
                return Ok(peripheral);
            }
        }
        Err(BleError::NotFound(address.to_string()))
    }

    fn characteristic(peripheral: &Peripheral, uuid: &Uuid) -> Result<Characteristic, BleError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *uuid)
            .ok_or(BleError::UnknownCharacteristic(*uuid))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.events.abort();
        for (_, link) in self.inner.links().drain() {
            link.notifications.abort();
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn start_scan(&self, params: &ScanParams) -> Result<(), BleError> {
        *self.inner.scan_filter() = Some(params.clone());
        self.inner
            .adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;

        let epoch = self.inner.scan_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        let duration = params.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if inner
                .scan_epoch
                .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                *inner.scan_filter() = None;
                if let Err(e) = inner.adapter.stop_scan().await {
                    debug!("Stopping expired scan failed: {}", e);
                }
                inner.sinks.timeout(TimeoutSource::Scan);
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.inner.scan_epoch.fetch_add(1, Ordering::SeqCst);
        *self.inner.scan_filter() = None;
        self.inner.adapter.stop_scan().await.map_err(rejected)
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<(), BleError> {
        let peripheral = self.find_peripheral(address).await?;
        let inner = Arc::clone(&self.inner);
        let address = *address;
        tokio::spawn(async move {
            if let Err(e) = peripheral.connect().await {
                warn!("Connecting to {} failed: {}", address, e);
                return;
            }
            if let Err(e) = peripheral.discover_services().await {
                warn!("Service discovery on {} failed: {}", address, e);
            }
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("No notification stream for {}: {}", address, e);
                    let _ = peripheral.disconnect().await;
                    return;
                }
            };

            let handle = ConnectionHandle(inner.next_handle.fetch_add(1, Ordering::SeqCst));
            let sink = Arc::clone(&inner);
            let notifications = tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    sink.sinks.notification(NotificationChunk {
                        handle,
                        characteristic: notification.uuid,
                        data: Bytes::from(notification.value),
                    });
                }
            });
            inner.links().insert(
                handle,
                Link {
                    peripheral,
                    address,
                    notifications,
                },
            );
            inner.sinks.connected(handle, address);
        });
        Ok(())
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(handle)?;
        peripheral.disconnect().await.map_err(rejected)?;
        let link = self.inner.links().remove(&handle);
        if let Some(link) = link {
            link.notifications.abort();
            self.inner
                .sinks
                .disconnected(handle, DisconnectReason::LocalHostTerminated);
        }
        Ok(())
    }

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
        data: &[u8],
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, data, WriteType::WithResponse)
            .await
            .map_err(rejected)
    }

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let peripheral = self.inner.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral.read(&target).await.map_err(rejected)
    }

    async fn enable_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await.map_err(rejected)
    }

    async fn disable_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<(), BleError> {
        let peripheral = self.inner.peripheral(handle)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&target).await.map_err(rejected)
    }

    async fn register_uuid_base(&self, base: &Uuid) -> Result<(), BleError> {
        // Host stacks address 128-bit UUIDs directly.
        debug!("UUID base {} needs no registration", base);
        Ok(())
    }

    async fn discover_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<GattService>, BleError> {
        let peripheral = self.inner.peripheral(handle)?;
        peripheral.discover_services().await.map_err(rejected)?;
        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    fn sinks(&self) -> &SinkRegistry {
        &self.inner.sinks
    }
}
