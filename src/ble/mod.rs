//! BLE transport layer
//!
//! Provides the transport abstraction the session and stream layers sit on,
//! an in-process simulated transport for testing, a btleplug-backed host
//! transport, and the identifier types (addresses, characteristic UUIDs)
//! shared by all of them.

pub mod address;
pub mod advertisement;
pub mod char_uuid;
#[cfg(feature = "ble-central")]
pub mod host;
pub mod simulated;
pub mod transport;

use thiserror::Error;

/// Operational failures of BLE operations.
///
/// None of these indicate a caller bug: they are the expected outcomes of
/// talking to a radio link (device absent, slow, or gone) and every consumer
/// operation reports them as a typed result instead of panicking.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("No device advertising as {0} was found")]
    NotFound(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Request rejected by transport: {0}")]
    Rejected(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Unknown characteristic {0}")]
    UnknownCharacteristic(::uuid::Uuid),

    #[error("Unknown service {0:?}")]
    UnknownService(String),
}
