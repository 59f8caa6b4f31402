//! End-to-end session tests over the simulated transport
//!
//! A `StreamClient` talks to a scripted peripheral through `SimTransport`.
//! All tests run on tokio's paused clock, so latencies and timeouts cost
//! no wall time.
//!
//! Run with:
//!   cargo test --test device_session

use std::sync::Arc;
use std::time::Duration;

use blepipe::ble::simulated::{SimPeripheral, SimPeripheralConfig, SimTransport};
use blepipe::ble::transport::{DisconnectReason, Transport};
use blepipe::services::{ServiceMap, COMMAND_SERVICE, CONTROL_MARKER, CONTROL_SERVICE};
use blepipe::{BleError, ClientConfig, DeviceAddress, ReadTimeout, SessionState, StreamClient};

use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const DEVICE: &str = "C6:D8:48:B4:61:7C";

fn address() -> DeviceAddress {
    DEVICE.parse().unwrap()
}

fn make_config() -> ClientConfig {
    let mut config = ClientConfig::default_for(address());
    config.connect_timeout_ms = 2_000;
    config.disconnect_timeout_ms = 1_000;
    config.write_timeout_ms = 500;
    config
}

/// A peripheral exposing the built-in services, echoing every write on the
/// notify characteristic of the service it was written to.
fn make_device(transport: &SimTransport) -> SimPeripheral {
    let services = ServiceMap::builtin();
    let mut config = SimPeripheralConfig::new(address()).with_local_name("MilkMeter");
    let mut echo: Vec<(Uuid, Uuid)> = Vec::new();
    for (_, entry) in services.iter() {
        let (write, notify) = (entry.write.resolve(), entry.notify.resolve());
        config = config.with_service(Uuid::nil(), &[write, notify]);
        echo.push((write, notify));
    }
    let peripheral = transport.add_peripheral(config);
    peripheral.set_responder(Arc::new(move |written, data| {
        echo.iter()
            .filter(|(write, _)| write == written)
            .map(|(_, notify)| (*notify, data.to_vec()))
            .collect()
    }));
    peripheral
}

fn make_client(transport: &Arc<SimTransport>) -> StreamClient {
    let transport: Arc<dyn Transport> = transport.clone();
    StreamClient::new(transport, make_config()).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_disconnect_round_trip() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);

    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert!(device.is_connected());

    client.close().await.unwrap();
    assert_eq!(client.session().state(), SessionState::Idle);
    assert!(!device.is_connected());

    // Second close is a no-op.
    client.close().await.unwrap();
    client
        .session()
        .disconnect(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(client.session().state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_writes_routed_by_marker() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);
    client.connect().await.unwrap();

    let services = ServiceMap::builtin();
    let command = [0xAA, 0x0E, 0x01, 0x02, 0x03, 0x01, 0x0E];
    let mut control = CONTROL_MARKER.to_vec();
    control.extend_from_slice(&[0x10, 0x20]);

    assert_eq!(client.write(&command).await, Ok(command.len()));
    assert_eq!(client.write(&control).await, Ok(control.len()));

    let writes = device.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].0, services.get(COMMAND_SERVICE).unwrap().write.resolve());
    assert_eq!(writes[1].0, services.get(CONTROL_SERVICE).unwrap().write.resolve());

    // Both echoes come back through the one stream, in order.
    let mut expected = command.to_vec();
    expected.extend_from_slice(&control);
    let got = client
        .read_with(expected.len(), ReadTimeout::Bounded(Duration::from_millis(200)))
        .await;
    assert_eq!(got, expected);
}

#[tokio::test(start_paused = true)]
async fn test_fragmented_response_reassembled() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);
    client.connect().await.unwrap();

    let notify = ServiceMap::builtin()
        .get(COMMAND_SERVICE)
        .unwrap()
        .notify
        .resolve();
    device.notify(notify, &[0x01, 0x02, 0x03]);
    device.notify(notify, &[0x04, 0x05]);

    assert_eq!(client.read(4).await, vec![0x01, 0x02, 0x03, 0x04]);
    assert_eq!(client.read(1).await, vec![0x05]);
    assert!(client
        .read_with(1, ReadTimeout::Bounded(Duration::ZERO))
        .await
        .is_empty());
    assert!(client.read_all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_drop_ends_blocked_read() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = Arc::new(make_client(&transport));
    client.connect().await.unwrap();

    let notify = ServiceMap::builtin()
        .get(COMMAND_SERVICE)
        .unwrap()
        .notify
        .resolve();
    device.notify(notify, &[0xAB]);

    let reader = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.read_with(8, ReadTimeout::Blocking).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    device.drop_link(DisconnectReason::SupervisionTimeout);

    assert_eq!(reader.await.unwrap(), vec![0xAB]);
    assert_eq!(client.session().state(), SessionState::Idle);
    assert_eq!(
        client.session().disconnect_reason(),
        Some(DisconnectReason::SupervisionTimeout)
    );
    assert_eq!(client.write(&[0x01]).await, Err(BleError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_peer_drop() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);

    client.connect().await.unwrap();
    device.drop_link(DisconnectReason::RemoteUserTerminated);
    assert!(!client.is_connected());

    client.connect().await.unwrap();
    assert_eq!(client.write(b"again").await, Ok(5));
    assert_eq!(client.read(5).await, b"again".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_starts_with_empty_stream() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);
    client.connect().await.unwrap();

    let notify = ServiceMap::builtin()
        .get(COMMAND_SERVICE)
        .unwrap()
        .notify
        .resolve();
    device.notify(notify, &[0x01, 0x02, 0x03]);
    device.notify(notify, &[0x04]);
    // Part of the first response is read, the rest dies with the link.
    assert_eq!(client.read(1).await, vec![0x01]);
    device.drop_link(DisconnectReason::SupervisionTimeout);

    client.connect().await.unwrap();
    device.notify(notify, &[0x10, 0x11]);
    assert_eq!(
        client.read_with(3, ReadTimeout::Bounded(Duration::ZERO)).await,
        vec![0x10, 0x11]
    );
}

#[tokio::test(start_paused = true)]
async fn test_absent_device_not_found() {
    let transport = SimTransport::new();
    let client = make_client(&transport);

    let result = client.connect().await;
    assert_eq!(result, Err(BleError::NotFound(DEVICE.to_string())));
    assert_eq!(client.session().state(), SessionState::Idle);
    assert_eq!(client.write(&[0x00]).await, Err(BleError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_unconnectable_device_not_found() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    device.set_connectable(false);
    let client = make_client(&transport);

    assert!(matches!(client.connect().await, Err(BleError::NotFound(_))));
    assert_eq!(transport.link_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_connection_is_released() {
    let transport = SimTransport::new();
    let services = ServiceMap::builtin();
    let entry = services.get(COMMAND_SERVICE).unwrap();
    let device = transport.add_peripheral(
        SimPeripheralConfig::new(address())
            .with_service(Uuid::nil(), &[entry.write.resolve(), entry.notify.resolve()])
            .with_connect_latency(Duration::from_secs(5)),
    );
    let client = make_client(&transport);

    assert!(matches!(client.connect().await, Err(BleError::NotFound(_))));

    // The link comes up after the caller gave up and is torn down again.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!device.is_connected());
    assert_eq!(transport.link_count(), 0);
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_keeps_session() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);
    client.connect().await.unwrap();

    device.set_write_latency(Duration::from_secs(2));
    assert_eq!(client.write(&[0x01]).await, Err(BleError::Timeout));
    assert!(client.is_connected());

    device.set_write_latency(Duration::ZERO);
    assert_eq!(client.write(&[0x02]).await, Ok(1));
    // Only the echo of the completed write arrives.
    assert_eq!(client.read(1).await, vec![0x02]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_disconnect_still_idle() {
    let transport = SimTransport::new();
    let device = make_device(&transport);
    let client = make_client(&transport);
    client.connect().await.unwrap();

    device.set_disconnect_latency(Duration::from_secs(30));
    assert_eq!(client.close().await, Err(BleError::Timeout));
    assert_eq!(client.session().state(), SessionState::Idle);
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scan_refused() {
    let transport = SimTransport::new();
    make_device(&transport);
    transport.set_scan_error(Some("adapter not powered".into()));
    let client = make_client(&transport);

    assert!(matches!(client.connect().await, Err(BleError::ScanError(_))));
    assert_eq!(client.session().state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_two_sessions_share_a_transport() {
    let transport = SimTransport::new();
    make_device(&transport);
    let other_address: DeviceAddress = "11:22:33:44:55:66".parse().unwrap();
    let mut other_config = make_config();
    other_config.address = other_address;
    let entry = *ServiceMap::builtin().get(COMMAND_SERVICE).unwrap();
    let other_device = transport.add_peripheral(
        SimPeripheralConfig::new(other_address)
            .with_service(Uuid::nil(), &[entry.write.resolve(), entry.notify.resolve()]),
    );

    let first = make_client(&transport);
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let second = StreamClient::new(dyn_transport, other_config).unwrap();
    first.connect().await.unwrap();
    second.connect().await.unwrap();

    other_device.notify(entry.notify.resolve(), &[0x42]);
    assert_eq!(second.read(1).await, vec![0x42]);
    assert!(first.read_all().is_empty());
}
