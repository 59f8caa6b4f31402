//! Connection lifecycle for one device
//!
//! `ConnectionSession` turns the transport's asynchronous events into two
//! awaitable calls. `connect` scans for the configured address, asks the
//! transport to connect when it is seen, and waits for the connected event.
//! `disconnect` tears the link down. Both are bounded by a caller timeout.
//!
//! ```text
//!   Idle/Failed --connect--> Scanning --connected event--> Connected
//!        ^                      | timeout / not found          |
//!        |<---------------------+                              |
//!        |<------ disconnect (Disconnecting) / peer drop ------+
//! ```
//!
//! Transport callbacks run on the transport's delivery context and only
//! touch the shared [`LinkCell`] under a short lock; consumer calls are
//! serialized among themselves. A peer-initiated disconnect always wins
//! over whatever a consumer call was about to conclude.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::ble::address::DeviceAddress;
use crate::ble::advertisement::Advertisement;
use crate::ble::transport::{
    ConnectionHandle, DisconnectReason, LinkEventSink, NotificationChunk, NotificationSink,
    ScanParams, TimeoutSource, Transport,
};
use crate::ble::BleError;
use crate::characteristic::CharacteristicIo;
use crate::config::{ClientConfig, ConfigError};
use crate::services::ServiceMap;
use crate::stream::queue::EventQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connected,
    Disconnecting,
    /// The last connect attempt could not even start (e.g. scan rejected).
    /// Behaves like `Idle` for the next `connect`.
    Failed,
}

/// What the scan callbacks hand to a waiting `connect`.
#[derive(Debug)]
enum ScanEvent {
    Seen(DeviceAddress),
    ScanTimedOut,
}

struct PendingConnect {
    events: mpsc::UnboundedSender<ScanEvent>,
    connected: Option<oneshot::Sender<ConnectionHandle>>,
    /// Addresses a connect request has already been issued for.
    requested: HashSet<DeviceAddress>,
}

struct LinkState {
    state: SessionState,
    handle: Option<ConnectionHandle>,
    disconnect_reason: Option<DisconnectReason>,
    pending: Option<PendingConnect>,
}

/// Connection state shared between a session, its callbacks and its
/// characteristic I/O. The handle is the single source of truth for
/// "is connected".
pub struct LinkCell {
    inner: Mutex<LinkState>,
}

impl LinkCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new(LinkState {
                state: SessionState::Idle,
                handle: None,
                disconnect_reason: None,
                pending: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.lock().handle
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.lock().disconnect_reason
    }

    fn begin_scan(&self, pending: PendingConnect) {
        let mut link = self.lock();
        link.state = SessionState::Scanning;
        link.pending = Some(pending);
    }

    fn fail_scan(&self) {
        let mut link = self.lock();
        link.pending = None;
        link.state = SessionState::Failed;
    }

    /// Close the scan phase and report the handle if the connected event
    /// made it in. Whatever the caller observed, this is the verdict.
    fn finish_scan(&self) -> Option<ConnectionHandle> {
        let mut link = self.lock();
        link.pending = None;
        match link.state {
            SessionState::Connected => link.handle,
            SessionState::Scanning => {
                link.state = SessionState::Idle;
                None
            }
            _ => None,
        }
    }

    fn begin_disconnect(&self) -> Option<ConnectionHandle> {
        let mut link = self.lock();
        let handle = link.handle?;
        link.state = SessionState::Disconnecting;
        Some(handle)
    }

    /// Forget `handle` if it is still the live one.
    fn end_link(&self, handle: ConnectionHandle) -> bool {
        let mut link = self.lock();
        if link.handle != Some(handle) {
            return false;
        }
        link.handle = None;
        link.state = SessionState::Idle;
        true
    }
}

/// Transport-facing side of a session.
struct SessionEvents {
    identity: DeviceAddress,
    link: Arc<LinkCell>,
    queue: Arc<EventQueue>,
    transport: Weak<dyn Transport>,
}

impl SessionEvents {
    /// A link nobody is waiting for (it came up after `connect` gave up):
    /// tear it down in the background.
    fn release_stray(&self, handle: ConnectionHandle) {
        warn!(
            "Connection {} to {} arrived with no connect pending; disconnecting",
            handle, self.identity
        );
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = transport.disconnect(handle).await {
                        warn!("Failed to release connection {}: {}", handle, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release connection {}", handle),
        }
    }
}

impl LinkEventSink for SessionEvents {
    fn on_advertisement(&self, advertisement: &Advertisement) {
        if advertisement.address != self.identity {
            return;
        }
        let mut link = self.link.lock();
        if let Some(pending) = link.pending.as_mut() {
            if pending.requested.insert(advertisement.address) {
                info!(
                    "Device found: {} (rssi {:?}, name {:?})",
                    advertisement.address,
                    advertisement.rssi,
                    advertisement.local_name()
                );
                let _ = pending.events.send(ScanEvent::Seen(advertisement.address));
            }
        }
    }

    fn on_connected(&self, handle: ConnectionHandle, address: DeviceAddress) {
        if address != self.identity {
            return;
        }
        let waiter = {
            let mut link = self.link.lock();
            let waiter = match link.state {
                SessionState::Scanning => link.pending.as_mut().and_then(|p| p.connected.take()),
                _ => None,
            };
            if waiter.is_some() {
                link.state = SessionState::Connected;
                link.handle = Some(handle);
                link.disconnect_reason = None;
            }
            waiter
        };
        match waiter {
            Some(waiter) => {
                let stale_bytes = self.queue.buffered_bytes();
                let stale = self.queue.clear();
                if stale > 0 {
                    debug!(
                        "Discarded {} chunk(s), {} bytes, left over from the previous link",
                        stale, stale_bytes
                    );
                }
                self.queue.open();
                let _ = waiter.send(handle);
            }
            None => self.release_stray(handle),
        }
    }

    fn on_disconnected(&self, handle: ConnectionHandle, reason: DisconnectReason) {
        let was_live = {
            let mut link = self.link.lock();
            if link.handle == Some(handle) {
                // Our own teardown reports LocalHostTerminated; anything else
                // came from the peer, even mid-disconnect.
                let ours = link.state == SessionState::Disconnecting
                    && reason == DisconnectReason::LocalHostTerminated;
                if !ours {
                    link.disconnect_reason = Some(reason);
                }
                link.handle = None;
                link.state = SessionState::Idle;
                true
            } else {
                false
            }
        };
        if was_live {
            info!(
                "Link {} to {} closed: {:?} (HCI 0x{:02x})",
                handle,
                self.identity,
                reason,
                reason.hci_code()
            );
            self.queue.close();
        }
    }

    fn on_timeout(&self, source: TimeoutSource) {
        if source != TimeoutSource::Scan {
            return;
        }
        if let Some(pending) = self.link.lock().pending.as_ref() {
            let _ = pending.events.send(ScanEvent::ScanTimedOut);
        }
    }
}

impl NotificationSink for SessionEvents {
    fn on_notification(&self, chunk: NotificationChunk) {
        if self.link.handle() != Some(chunk.handle) {
            return;
        }
        debug!(
            "Notification received: {} = {}",
            chunk.characteristic,
            hex::encode_upper(&chunk.data)
        );
        self.queue.push(chunk);
    }
}

/// One logical device session over a shared transport.
pub struct ConnectionSession {
    identity: DeviceAddress,
    transport: Arc<dyn Transport>,
    link: Arc<LinkCell>,
    queue: Arc<EventQueue>,
    io: CharacteristicIo,
    subscriptions: [Uuid; 2],
    /// Serializes consumer-driven transitions.
    op: tokio::sync::Mutex<()>,
}

impl ConnectionSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: DeviceAddress,
        services: ServiceMap,
        io_timeout: Duration,
    ) -> Self {
        let link = Arc::new(LinkCell::new());
        let queue = Arc::new(EventQueue::new());
        queue.close();

        let events = Arc::new(SessionEvents {
            identity,
            link: Arc::clone(&link),
            queue: Arc::clone(&queue),
            transport: Arc::downgrade(&transport),
        });
        let subscriptions = [
            transport.subscribe_link(events.clone()),
            transport.subscribe_notifications(events),
        ];
        let io = CharacteristicIo::new(
            Arc::clone(&transport),
            Arc::clone(&link),
            Arc::new(services),
            io_timeout,
        );

        Self {
            identity,
            transport,
            link,
            queue,
            io,
            subscriptions,
            op: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a session from a configuration, validating it first.
    pub fn from_config(
        transport: Arc<dyn Transport>,
        config: &ClientConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            transport,
            config.address,
            config.service_map(),
            config.io_timeout(),
        ))
    }

    /// Address of the device this session connects to.
    pub fn identity(&self) -> DeviceAddress {
        self.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.link.state()
    }

    /// Handle of the live link, if any.
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.link.handle()
    }

    pub fn is_connected(&self) -> bool {
        self.handle().is_some()
    }

    /// Why the peer last dropped the link, including during a local
    /// `disconnect`.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.link.disconnect_reason()
    }

    /// The queue notifications of this session land in.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Characteristic-level I/O over the live link.
    pub fn io(&self) -> &CharacteristicIo {
        &self.io
    }

    /// Scan for the device and connect to it within `timeout`.
    ///
    /// Already connected: returns the live handle. Not found in time:
    /// `BleError::NotFound` and the session is back to `Idle`. On success
    /// notifications are enabled on every service's notify characteristic.
    pub async fn connect(&self, timeout: Duration) -> Result<ConnectionHandle, BleError> {
        let _op = self.op.lock().await;
        if let Some(handle) = self.link.handle() {
            return Ok(handle);
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (connected_tx, mut connected_rx) = oneshot::channel();
        self.link.begin_scan(PendingConnect {
            events: events_tx,
            connected: Some(connected_tx),
            requested: HashSet::new(),
        });

        info!("Scan start, trying to find {}", self.identity);
        let params = ScanParams::new(vec![self.identity], timeout);
        if let Err(e) = self.transport.start_scan(&params).await {
            warn!("Could not start scan for {}: {}", self.identity, e);
            self.link.fail_scan();
            return Err(e);
        }

        let _ = tokio::time::timeout(timeout, async {
            loop {
                tokio::select! {
                    _ = &mut connected_rx => return,
                    event = events_rx.recv() => match event {
                        Some(ScanEvent::Seen(address)) => {
                            if let Err(e) = self.transport.connect(&address).await {
                                warn!("Connect request to {} failed: {}", address, e);
                            }
                        }
                        Some(ScanEvent::ScanTimedOut) => {
                            debug!("Scan window closed, restarting");
                            if let Err(e) = self.transport.start_scan(&params).await {
                                warn!("Could not restart scan: {}", e);
                            }
                        }
                        None => return,
                    },
                }
            }
        })
        .await;
        if let Err(e) = self.transport.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }

        let Some(handle) = self.link.finish_scan() else {
            info!("No device advertising as {} found", self.identity);
            return Err(BleError::NotFound(self.identity.to_string()));
        };
        info!("New connection: {} ({})", self.identity, handle);

        self.io.register_service_bases().await;
        for id in self.io.services().notify_characteristics() {
            if let Err(e) = self.io.start_notify(id).await {
                warn!("Could not enable notifications on {}: {}", id, e);
            }
        }

        // A peer drop during setup wins over the connect.
        match self.link.handle() {
            Some(live) if live == handle => Ok(handle),
            _ => Err(BleError::Disconnected),
        }
    }

    /// Disconnect within `timeout`.
    ///
    /// Notifications are disabled first, best effort. The session ends up
    /// `Idle` even when the transport does not confirm in time (reported as
    /// `BleError::Timeout`). Disconnecting an idle session succeeds.
    pub async fn disconnect(&self, timeout: Duration) -> Result<(), BleError> {
        let _op = self.op.lock().await;
        let Some(handle) = self.link.begin_disconnect() else {
            return Ok(());
        };

        for id in self.io.services().notify_characteristics() {
            if let Err(e) = self.io.stop_notify(id).await {
                warn!("Ignoring failure to disable notifications on {}: {}", id, e);
            }
        }

        let result = match tokio::time::timeout(timeout, self.transport.disconnect(handle)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Error occurred while disconnecting: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Disconnection request timed out");
                Err(BleError::Timeout)
            }
        };

        if self.link.end_link(handle) {
            self.queue.close();
        }
        info!("Disconnect: {}", self.identity);
        result
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        for id in self.subscriptions {
            self.transport.unsubscribe(id);
        }
    }
}
