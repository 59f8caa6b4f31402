//! In-process BLE simulator
//!
//! Provides a simulated central driver with scripted peripherals: they
//! advertise while a scan is running, accept connections after a latency,
//! store characteristic values, turn writes into notifications through an
//! optional responder, and can drop the link on their own. Used for
//! integration testing and the CLI demo without real BLE hardware.
//!
//! All timing uses tokio time, so paused clocks advance instantly in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use uuid::Uuid;

use super::address::DeviceAddress;
use super::advertisement::{self, Advertisement};
use super::transport::{
    ConnectionHandle, DisconnectReason, GattService, NotificationChunk, ScanParams, SinkRegistry,
    TimeoutSource, Transport,
};
use super::BleError;

/// Turns a write into zero or more `(characteristic, payload)` notifications.
pub type Responder = Arc<dyn Fn(&Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + Sync>;

/// Static description of a simulated peripheral.
#[derive(Debug, Clone)]
pub struct SimPeripheralConfig {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: i16,
    pub services: Vec<GattService>,
    pub connectable: bool,
    pub connect_latency: Duration,
    pub write_latency: Duration,
    pub disconnect_latency: Duration,
}

impl SimPeripheralConfig {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            local_name: None,
            manufacturer_data: None,
            rssi: -50,
            services: Vec::new(),
            connectable: true,
            connect_latency: Duration::from_millis(30),
            write_latency: Duration::ZERO,
            disconnect_latency: Duration::ZERO,
        }
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.manufacturer_data = Some(data);
        self
    }

    pub fn with_service(mut self, uuid: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push(GattService {
            uuid,
            characteristics: characteristics.to_vec(),
        });
        self
    }

    /// Delay between a connect request and the connected event.
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    fn has_characteristic(&self, characteristic: &Uuid) -> bool {
        self.services
            .iter()
            .any(|service| service.characteristics.contains(characteristic))
    }
}

struct PeripheralState {
    config: SimPeripheralConfig,
    advertising: bool,
    reject_writes: bool,
    values: HashMap<Uuid, Vec<u8>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    responder: Option<Responder>,
}

struct Link {
    address: DeviceAddress,
    notifying: HashSet<Uuid>,
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<DeviceAddress, PeripheralState>,
    links: HashMap<ConnectionHandle, Link>,
    registered_bases: HashSet<Uuid>,
    scan_error: Option<String>,
    scans_started: usize,
}

struct SimInner {
    sinks: SinkRegistry,
    state: Mutex<SimState>,
    /// Bumped on every scan start/stop; a scan task exits once it is stale.
    scan_epoch: AtomicU64,
    next_handle: AtomicU16,
    advertising_interval: Duration,
}

impl SimInner {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `data` on every link to `address` that has notifications
    /// enabled for `characteristic`. Returns how many links received it.
    fn notify(&self, address: &DeviceAddress, characteristic: Uuid, data: &[u8]) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .state()
            .links
            .iter()
            .filter(|(_, link)| link.address == *address && link.notifying.contains(&characteristic))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            self.sinks.notification(NotificationChunk {
                handle: *handle,
                characteristic,
                data: Bytes::copy_from_slice(data),
            });
        }
        handles.len()
    }

    fn drop_links(&self, address: &DeviceAddress, reason: DisconnectReason) -> usize {
        let handles: Vec<ConnectionHandle> = {
            let mut state = self.state();
            let handles: Vec<ConnectionHandle> = state
                .links
                .iter()
                .filter(|(_, link)| link.address == *address)
                .map(|(handle, _)| *handle)
                .collect();
            for handle in &handles {
                state.links.remove(handle);
            }
            handles
        };
        for handle in &handles {
            self.sinks.disconnected(*handle, reason);
        }
        handles.len()
    }

    fn link_address(&self, handle: ConnectionHandle) -> Result<DeviceAddress, BleError> {
        self.state()
            .links
            .get(&handle)
            .map(|link| link.address)
            .ok_or_else(|| BleError::Rejected(format!("invalid connection handle {handle}")))
    }
}

/// The simulated central driver.
pub struct SimTransport {
    inner: Arc<SimInner>,
}

impl SimTransport {
    /// Create a new simulated transport.
    pub fn new() -> Arc<Self> {
        Self::with_advertising_interval(Duration::from_millis(20))
    }

    /// Create a transport whose peripherals advertise every `interval`.
    pub fn with_advertising_interval(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SimInner {
                sinks: SinkRegistry::new(),
                state: Mutex::new(SimState::default()),
                scan_epoch: AtomicU64::new(0),
                next_handle: AtomicU16::new(0),
                advertising_interval: interval,
            }),
        })
    }

    /// Add a peripheral to the simulated air. It advertises immediately.
    pub fn add_peripheral(&self, config: SimPeripheralConfig) -> SimPeripheral {
        let address = config.address;
        self.inner.state().peripherals.insert(
            address,
            PeripheralState {
                config,
                advertising: true,
                reject_writes: false,
                values: HashMap::new(),
                writes: Vec::new(),
                responder: None,
            },
        );
        SimPeripheral {
            address,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Make subsequent scan requests fail (or succeed again with `None`).
    pub fn set_scan_error(&self, error: Option<String>) {
        self.inner.state().scan_error = error;
    }

    /// Vendor UUID bases registered so far.
    pub fn registered_bases(&self) -> HashSet<Uuid> {
        self.inner.state().registered_bases.clone()
    }

    /// Number of scan requests accepted so far.
    pub fn scans_started(&self) -> usize {
        self.inner.state().scans_started
    }

    /// Number of currently open links.
    pub fn link_count(&self) -> usize {
        self.inner.state().links.len()
    }

    /// Number of active event subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.sinks.len()
    }
}

/// Control handle for one simulated peripheral.
#[derive(Clone)]
pub struct SimPeripheral {
    address: DeviceAddress,
    inner: Arc<SimInner>,
}

impl SimPeripheral {
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut PeripheralState) -> R) -> Option<R> {
        self.inner.state().peripherals.get_mut(&self.address).map(f)
    }

    /// Push a notification to every central subscribed to `characteristic`.
    /// Returns how many links received it.
    pub fn notify(&self, characteristic: Uuid, data: &[u8]) -> usize {
        self.inner.notify(&self.address, characteristic, data)
    }

    /// Peer-initiated disconnect of every link to this peripheral.
    pub fn drop_link(&self, reason: DisconnectReason) -> usize {
        self.inner.drop_links(&self.address, reason)
    }

    /// Whether any central holds a link to this peripheral.
    pub fn is_connected(&self) -> bool {
        let address = self.address;
        self.inner.state().links.values().any(|link| link.address == address)
    }

    /// Whether some central has notifications enabled on `characteristic`.
    pub fn is_notifying(&self, characteristic: &Uuid) -> bool {
        let address = self.address;
        self.inner
            .state()
            .links
            .values()
            .any(|link| link.address == address && link.notifying.contains(characteristic))
    }

    /// Start or stop advertising; scans only see advertising peripherals.
    pub fn set_advertising(&self, advertising: bool) {
        self.with_state(|p| p.advertising = advertising);
    }

    /// A non-connectable peripheral still advertises but ignores connects.
    pub fn set_connectable(&self, connectable: bool) {
        self.with_state(|p| p.config.connectable = connectable);
    }

    /// Delay before each write completes.
    pub fn set_write_latency(&self, latency: Duration) {
        self.with_state(|p| p.config.write_latency = latency);
    }

    /// Delay before a central-initiated disconnect completes.
    pub fn set_disconnect_latency(&self, latency: Duration) {
        self.with_state(|p| p.config.disconnect_latency = latency);
    }

    /// Refuse every write with `BleError::Rejected`.
    pub fn set_reject_writes(&self, reject: bool) {
        self.with_state(|p| p.reject_writes = reject);
    }

    /// Value returned by reads of `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.with_state(|p| p.values.insert(characteristic, value));
    }

    /// Turn accepted writes into notifications.
    pub fn set_responder(&self, responder: Responder) {
        self.with_state(|p| p.responder = Some(responder));
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.with_state(|p| p.writes.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn start_scan(&self, params: &ScanParams) -> Result<(), BleError> {
        {
            let mut state = self.inner.state();
            if let Some(error) = &state.scan_error {
                return Err(BleError::ScanError(error.clone()));
            }
            state.scans_started += 1;
        }
        let epoch = self.inner.scan_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        let params = params.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + params.duration;
            loop {
                if inner.scan_epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                if Instant::now() >= deadline {
                    break;
                }
                let reports: Vec<Advertisement> = inner
                    .state()
                    .peripherals
                    .values()
                    .filter(|p| p.advertising && params.admits(&p.config.address))
                    .map(|p| Advertisement {
                        address: p.config.address,
                        rssi: Some(p.config.rssi),
                        data: advertisement::encode(
                            p.config.local_name.as_deref(),
                            p.config.manufacturer_data.as_deref(),
                        ),
                    })
                    .collect();
                for report in &reports {
                    inner.sinks.advertisement(report);
                }
                let next = Instant::now() + inner.advertising_interval;
                tokio::time::sleep_until(next.min(deadline)).await;
            }
            // Only the scan that is still current reports its timeout.
            if inner
                .scan_epoch
                .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                inner.sinks.timeout(TimeoutSource::Scan);
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.inner.scan_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress) -> Result<(), BleError> {
        let latency = {
            let state = self.inner.state();
            match state.peripherals.get(address) {
                Some(p) => p.config.connect_latency,
                // Nobody answers: the request stays pending, as on air.
                None => return Ok(()),
            }
        };
        let inner = Arc::clone(&self.inner);
        let address = *address;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let handle = {
                let mut state = inner.state();
                let connectable = state
                    .peripherals
                    .get(&address)
                    .map(|p| p.config.connectable)
                    .unwrap_or(false);
                if !connectable {
                    return;
                }
                let handle = ConnectionHandle(inner.next_handle.fetch_add(1, Ordering::SeqCst));
                state.links.insert(
                    handle,
                    Link {
                        address,
                        notifying: HashSet::new(),
                    },
                );
                handle
            };
            inner.sinks.connected(handle, address);
        });
        Ok(())
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), BleError> {
        let address = self.inner.link_address(handle)?;
        let latency = self
            .inner
            .state()
            .peripherals
            .get(&address)
            .map(|p| p.config.disconnect_latency)
            .unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.inner.state().links.remove(&handle).is_some() {
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
        let address = self.inner.link_address(handle)?;
        let latency = self
            .inner
            .state()
            .peripherals
            .get(&address)
            .map(|p| p.config.write_latency)
            .unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // The link may have dropped while the write was in flight.
        self.inner.link_address(handle)?;

        let responder = {
            let mut state = self.inner.state();
            let peripheral = state
                .peripherals
                .get_mut(&address)
                .ok_or_else(|| BleError::Rejected(format!("no peripheral at {address}")))?;
            if peripheral.reject_writes {
                return Err(BleError::Rejected("write not permitted".to_string()));
            }
            if !peripheral.config.has_characteristic(characteristic) {
                return Err(BleError::UnknownCharacteristic(*characteristic));
            }
            peripheral.writes.push((*characteristic, data.to_vec()));
            peripheral.responder.clone()
        };

        if let Some(responder) = responder {
            for (notify_char, payload) in responder(characteristic, data) {
                self.inner.notify(&address, notify_char, &payload);
            }
        }
        Ok(())
    }

    async fn read(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<Vec<u8>, BleError> {
        let address = self.inner.link_address(handle)?;
        let state = self.inner.state();
        let peripheral = state
            .peripherals
            .get(&address)
            .ok_or_else(|| BleError::Rejected(format!("no peripheral at {address}")))?;
        if !peripheral.config.has_characteristic(characteristic) {
            return Err(BleError::UnknownCharacteristic(*characteristic));
        }
        Ok(peripheral.values.get(characteristic).cloned().unwrap_or_default())
    }

    async fn enable_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<(), BleError> {
        let mut state = self.inner.state();
        let address = state
            .links
            .get(&handle)
            .map(|link| link.address)
            .ok_or_else(|| BleError::Rejected(format!("invalid connection handle {handle}")))?;
        let known = state
            .peripherals
            .get(&address)
            .map(|p| p.config.has_characteristic(characteristic))
            .unwrap_or(false);
        if !known {
            return Err(BleError::UnknownCharacteristic(*characteristic));
        }
        if let Some(link) = state.links.get_mut(&handle) {
            link.notifying.insert(*characteristic);
        }
        Ok(())
    }

    async fn disable_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<(), BleError> {
        let mut state = self.inner.state();
        let link = state
            .links
            .get_mut(&handle)
            .ok_or_else(|| BleError::Rejected(format!("invalid connection handle {handle}")))?;
        link.notifying.remove(characteristic);
        Ok(())
    }

    async fn register_uuid_base(&self, base: &Uuid) -> Result<(), BleError> {
        self.inner.state().registered_bases.insert(*base);
        Ok(())
    }

    async fn discover_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<GattService>, BleError> {
        let address = self.inner.link_address(handle)?;
        Ok(self
            .inner
            .state()
            .peripherals
            .get(&address)
            .map(|p| p.config.services.clone())
            .unwrap_or_default())
    }

    fn sinks(&self) -> &SinkRegistry {
        &self.inner.sinks
    }
}
