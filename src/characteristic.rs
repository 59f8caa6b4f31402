//! Characteristic I/O against the live connection
//!
//! Every call looks up the session's current connection handle, resolves
//! the characteristic identifier (registering its vendor base with the
//! transport the first time it is seen), and bounds the transport request
//! with a timeout. Failures come back as [`BleError`]; nothing here panics
//! on a transport-level problem.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::ble::char_uuid::CharUuid;
use crate::ble::transport::{ConnectionHandle, GattService, Transport};
use crate::ble::BleError;
use crate::services::ServiceMap;
use crate::session::LinkCell;

/// Bound a transport request by `limit`.
async fn bounded<T>(
    limit: Duration,
    request: impl std::future::Future<Output = Result<T, BleError>>,
) -> Result<T, BleError> {
    tokio::time::timeout(limit, request)
        .await
        .unwrap_or(Err(BleError::Timeout))
}

/// Read/write/notify access to the characteristics of one session.
///
/// Cheap to clone; clones share the link and the set of registered bases.
#[derive(Clone)]
pub struct CharacteristicIo {
    transport: Arc<dyn Transport>,
    link: Arc<LinkCell>,
    services: Arc<ServiceMap>,
    registered: Arc<Mutex<HashSet<Uuid>>>,
    io_timeout: Duration,
}

impl CharacteristicIo {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        link: Arc<LinkCell>,
        services: Arc<ServiceMap>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            link,
            services,
            registered: Arc::new(Mutex::new(HashSet::new())),
            io_timeout,
        }
    }

    /// The service table writes are routed through.
    pub fn services(&self) -> &ServiceMap {
        &self.services
    }

    fn handle(&self) -> Result<ConnectionHandle, BleError> {
        self.link.handle().ok_or(BleError::NotConnected)
    }

    /// The transport form of `id`, registering its vendor base if needed.
    async fn resolve(&self, id: CharUuid) -> Result<Uuid, BleError> {
        if let Some(base) = id.vendor_base() {
            let known = self
                .registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&base);
            if !known {
                debug!(
                    "Registering UUID base {} for alias 0x{:04x}",
                    base,
                    id.alias()
                );
                self.transport.register_uuid_base(&base).await?;
                self.registered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(base);
            }
        }
        Ok(id.resolve())
    }

    /// Register every vendor base the service table uses.
    ///
    /// Returns how many bases failed to register; each failure is logged.
    pub async fn register_service_bases(&self) -> usize {
        let mut failures = 0;
        for (name, entry) in self.services.iter() {
            for id in [entry.write, entry.notify] {
                if let Err(e) = self.resolve(id).await {
                    warn!("Failed to register UUID base for {} ({}): {}", name, id, e);
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Write a command payload to whichever service its marker selects.
    ///
    /// Returns the number of bytes written.
    pub async fn write(&self, payload: &[u8], timeout: Duration) -> Result<usize, BleError> {
        let service = self.services.route(payload);
        self.write_service(service, payload, timeout).await
    }

    /// Write to the write characteristic of a named service.
    pub async fn write_service(
        &self,
        service: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<usize, BleError> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| BleError::UnknownService(service.to_string()))?;
        self.write_to(entry.write, payload, timeout).await?;
        Ok(payload.len())
    }

    /// Write raw bytes to one characteristic.
    pub async fn write_to(
        &self,
        characteristic: CharUuid,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), BleError> {
        let handle = self.handle()?;
        let uuid = self.resolve(characteristic).await?;
        match bounded(timeout, self.transport.write(handle, &uuid, data)).await {
            Ok(()) => {
                debug!("Wrote {} to characteristic {}", hex::encode(data), characteristic);
                Ok(())
            }
            Err(BleError::Timeout) => {
                warn!(
                    "Write timed out after {} ms for characteristic {}",
                    timeout.as_millis(),
                    characteristic
                );
                Err(BleError::Timeout)
            }
            Err(e) => {
                warn!(
                    "Failed to write {} to characteristic {}: {}",
                    hex::encode(data),
                    characteristic,
                    e
                );
                Err(e)
            }
        }
    }

    /// Read the current value of a characteristic.
    pub async fn read(&self, characteristic: CharUuid) -> Result<Vec<u8>, BleError> {
        let handle = self.handle()?;
        let uuid = self.resolve(characteristic).await?;
        let value = bounded(self.io_timeout, self.transport.read(handle, &uuid))
            .await
            .map_err(|e| {
                warn!("Read from characteristic {} failed: {}", characteristic, e);
                e
            })?;
        debug!("Read {} from characteristic {}", hex::encode(&value), characteristic);
        Ok(value)
    }

    /// Read a characteristic and decode it as text, dropping invalid UTF-8.
    pub async fn read_string(&self, characteristic: CharUuid) -> Result<String, BleError> {
        let value = self.read(characteristic).await?;
        Ok(String::from_utf8_lossy(&value).replace('\u{FFFD}', ""))
    }

    /// Subscribe to notifications on a characteristic.
    pub async fn start_notify(&self, characteristic: CharUuid) -> Result<(), BleError> {
        let handle = self.handle()?;
        let uuid = self.resolve(characteristic).await?;
        bounded(self.io_timeout, self.transport.enable_notify(handle, &uuid)).await?;
        info!("Notification enabled on {}", characteristic);
        Ok(())
    }

    /// Unsubscribe from notifications on a characteristic.
    pub async fn stop_notify(&self, characteristic: CharUuid) -> Result<(), BleError> {
        let handle = self.handle()?;
        let uuid = self.resolve(characteristic).await?;
        bounded(self.io_timeout, self.transport.disable_notify(handle, &uuid)).await?;
        info!("Notification disabled on {}", characteristic);
        Ok(())
    }

    /// List the peer's services and their characteristics.
    pub async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        let handle = self.handle()?;
        bounded(self.io_timeout, self.transport.discover_services(handle)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::address::DeviceAddress;
    use crate::ble::simulated::{SimPeripheral, SimPeripheralConfig, SimTransport};
    use crate::services::{COMMAND_SERVICE, CONTROL_MARKER, CONTROL_SERVICE};
    use crate::session::ConnectionSession;

    const ADDR: DeviceAddress = DeviceAddress::new([0xF1, 0x02, 0x03, 0x04, 0x05, 0x06]);
    const NAME_CHAR: CharUuid = CharUuid::Standard(0x2A00);

    async fn connected() -> (Arc<SimTransport>, SimPeripheral, ConnectionSession) {
        let transport = SimTransport::new();
        let services = ServiceMap::builtin();
        let mut config = SimPeripheralConfig::new(ADDR).with_service(
            CharUuid::Standard(0x1800).resolve(),
            &[NAME_CHAR.resolve()],
        );
        for (_, entry) in services.iter() {
            config = config.with_service(Uuid::nil(), &[entry.write.resolve(), entry.notify.resolve()]);
        }
        let peripheral = transport.add_peripheral(config);
        let session = ConnectionSession::new(
            transport.clone(),
            ADDR,
            services,
            Duration::from_millis(500),
        );
        session.connect(Duration::from_secs(5)).await.unwrap();
        (transport, peripheral, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_follows_marker() {
        let (_transport, peripheral, session) = connected().await;
        let io = session.io();
        let services = ServiceMap::builtin();

        let mut control = CONTROL_MARKER.to_vec();
        control.push(0x42);
        assert_eq!(io.write(&control, Duration::from_secs(1)).await, Ok(9));
        assert_eq!(io.write(&[0xAA, 0x01], Duration::from_secs(1)).await, Ok(2));

        let writes = peripheral.writes();
        assert_eq!(writes[0].0, services.get(CONTROL_SERVICE).unwrap().write.resolve());
        assert_eq!(writes[1].0, services.get(COMMAND_SERVICE).unwrap().write.resolve());
        assert_eq!(writes[1].1, vec![0xAA, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout() {
        let (_transport, peripheral, session) = connected().await;
        peripheral.set_write_latency(Duration::from_secs(2));
        let result = session.io().write(&[1], Duration::from_millis(100)).await;
        assert_eq!(result, Err(BleError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_write_is_reported() {
        let (_transport, peripheral, session) = connected().await;
        peripheral.set_reject_writes(true);
        let result = session.io().write(&[1], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BleError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_service() {
        let (_transport, _peripheral, session) = connected().await;
        let result = session.io().write_service("XYZ", &[1], Duration::from_secs(1)).await;
        assert_eq!(result, Err(BleError::UnknownService("XYZ".into())));
    }

    #[tokio::test]
    async fn test_idle_session_is_not_connected() {
        let transport = SimTransport::new();
        let session =
            ConnectionSession::new(transport, ADDR, ServiceMap::builtin(), Duration::from_secs(1));
        let io = session.io();
        assert_eq!(io.write(&[1], Duration::from_secs(1)).await, Err(BleError::NotConnected));
        assert_eq!(io.read(NAME_CHAR).await, Err(BleError::NotConnected));
        assert_eq!(io.start_notify(NAME_CHAR).await, Err(BleError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_string_drops_invalid_utf8() {
        let (_transport, peripheral, session) = connected().await;
        peripheral.set_value(NAME_CHAR.resolve(), b"Milk\xFFMeter".to_vec());
        assert_eq!(session.io().read_string(NAME_CHAR).await.unwrap(), "MilkMeter");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_services() {
        let (_transport, _peripheral, session) = connected().await;
        let services = session.io().discover_services().await.unwrap();
        assert_eq!(services.len(), 3);
        assert_eq!(services[0].characteristics, vec![NAME_CHAR.resolve()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_identifiers_need_no_base() {
        let (transport, _peripheral, session) = connected().await;
        let before = transport.registered_bases().len();
        session.io().read(NAME_CHAR).await.unwrap();
        assert_eq!(transport.registered_bases().len(), before);
    }
}
