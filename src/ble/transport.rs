//! BLE transport trait definitions and core types
//!
//! Defines the driver boundary that both the simulated transport and the
//! btleplug host transport conform to. Requests are async methods on
//! [`Transport`]; everything the radio reports on its own (advertisements,
//! link up/down, notifications, scan timeouts) is pushed to subscribed
//! sinks from the transport's delivery context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::address::DeviceAddress;
use super::advertisement::Advertisement;
use super::BleError;

/// Transport-issued token for an active link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u16);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a link went down, by HCI reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 0x08: supervision timeout, the peer went out of range.
    SupervisionTimeout,
    /// 0x13: the peer closed the link.
    RemoteUserTerminated,
    /// 0x16: we closed the link.
    LocalHostTerminated,
    Other(u8),
}

impl DisconnectReason {
    pub fn from_hci(code: u8) -> Self {
        match code {
            0x08 => DisconnectReason::SupervisionTimeout,
            0x13 => DisconnectReason::RemoteUserTerminated,
            0x16 => DisconnectReason::LocalHostTerminated,
            other => DisconnectReason::Other(other),
        }
    }

    pub fn hci_code(&self) -> u8 {
        match self {
            DisconnectReason::SupervisionTimeout => 0x08,
            DisconnectReason::RemoteUserTerminated => 0x13,
            DisconnectReason::LocalHostTerminated => 0x16,
            DisconnectReason::Other(code) => *code,
        }
    }
}

/// Which transport-internal timer expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Scan,
    Connection,
}

/// Parameters for a scan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    /// Addresses of interest. Empty means report every advertiser.
    pub filter: Vec<DeviceAddress>,
    /// How long the transport scans before reporting a scan timeout.
    pub duration: Duration,
}

impl ScanParams {
    pub fn new(filter: Vec<DeviceAddress>, duration: Duration) -> Self {
        Self { filter, duration }
    }

    /// Whether an advertiser passes the address filter.
    pub fn admits(&self, address: &DeviceAddress) -> bool {
        self.filter.is_empty() || self.filter.contains(address)
    }
}

/// The payload of one received notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationChunk {
    pub handle: ConnectionHandle,
    pub characteristic: Uuid,
    pub data: Bytes,
}

/// A service exposed by a connected peer, as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Receiver of link-level events.
///
/// Called from the transport's delivery context: implementations must
/// return promptly and never wait on consumer logic.
pub trait LinkEventSink: Send + Sync {
    fn on_advertisement(&self, _advertisement: &Advertisement) {}

    fn on_connected(&self, _handle: ConnectionHandle, _address: DeviceAddress) {}

    fn on_disconnected(&self, _handle: ConnectionHandle, _reason: DisconnectReason) {}

    fn on_timeout(&self, _source: TimeoutSource) {}
}

/// Receiver of characteristic notifications. Same rules as [`LinkEventSink`].
pub trait NotificationSink: Send + Sync {
    fn on_notification(&self, chunk: NotificationChunk);
}

/// BLE central driver.
///
/// Characteristics are addressed by their resolved 128-bit UUID. Requests
/// carry no timeout of their own; callers bound them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start scanning. The transport reports a [`TimeoutSource::Scan`]
    /// timeout once `params.duration` has elapsed.
    async fn start_scan(&self, params: &ScanParams) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Request a connection. Success means the request was accepted; the
    /// link is up only once `on_connected` fires.
    async fn connect(&self, address: &DeviceAddress) -> Result<(), BleError>;

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), BleError>;

    async fn write(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
        data: &[u8],
    ) -> Result<(), BleError>;

    async fn read(&self, handle: ConnectionHandle, characteristic: &Uuid)
        -> Result<Vec<u8>, BleError>;

    async fn enable_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<(), BleError>;

    async fn disable_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: &Uuid,
    ) -> Result<(), BleError>;

    /// Register a vendor UUID base so characteristics on it can be addressed.
    async fn register_uuid_base(&self, base: &Uuid) -> Result<(), BleError>;

    async fn discover_services(&self, handle: ConnectionHandle)
        -> Result<Vec<GattService>, BleError>;

    /// The registry events are delivered through.
    fn sinks(&self) -> &SinkRegistry;

    /// Subscribe to link events. Returns a subscription ID.
    fn subscribe_link(&self, sink: Arc<dyn LinkEventSink>) -> Uuid {
        self.sinks().add(Sink::Link(sink))
    }

    /// Subscribe to notifications. Returns a subscription ID.
    fn subscribe_notifications(&self, sink: Arc<dyn NotificationSink>) -> Uuid {
        self.sinks().add(Sink::Notification(sink))
    }

    /// Drop a subscription made with either `subscribe_*` method.
    fn unsubscribe(&self, subscription_id: Uuid) {
        self.sinks().remove(&subscription_id);
    }
}

#[derive(Clone)]
pub enum Sink {
    Link(Arc<dyn LinkEventSink>),
    Notification(Arc<dyn NotificationSink>),
}

/// Subscription table shared by transport implementations.
///
/// Dispatch snapshots the table before calling out, so a sink may
/// (un)subscribe from inside a callback.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<HashMap<Uuid, Sink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Uuid, Sink>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, sink: Sink) -> Uuid {
        let id = Uuid::new_v4();
        self.table().insert(id, sink);
        id
    }

    pub fn remove(&self, id: &Uuid) {
        self.table().remove(id);
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn link_sinks(&self) -> Vec<Arc<dyn LinkEventSink>> {
        self.table()
            .values()
            .filter_map(|sink| match sink {
                Sink::Link(link) => Some(Arc::clone(link)),
                Sink::Notification(_) => None,
            })
            .collect()
    }

    pub fn advertisement(&self, advertisement: &Advertisement) {
        for sink in self.link_sinks() {
            sink.on_advertisement(advertisement);
        }
    }

    pub fn connected(&self, handle: ConnectionHandle, address: DeviceAddress) {
        for sink in self.link_sinks() {
            sink.on_connected(handle, address);
        }
    }

    pub fn disconnected(&self, handle: ConnectionHandle, reason: DisconnectReason) {
        for sink in self.link_sinks() {
            sink.on_disconnected(handle, reason);
        }
    }

    pub fn timeout(&self, source: TimeoutSource) {
        for sink in self.link_sinks() {
            sink.on_timeout(source);
        }
    }

    pub fn notification(&self, chunk: NotificationChunk) {
        let sinks: Vec<Arc<dyn NotificationSink>> = self
            .table()
            .values()
            .filter_map(|sink| match sink {
                Sink::Notification(n) => Some(Arc::clone(n)),
                Sink::Link(_) => None,
            })
            .collect();
        for sink in sinks {
            sink.on_notification(chunk.clone());
        }
    }
}
