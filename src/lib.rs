// blepipe - BLE link lifecycle and notification byte streams

pub mod ble;
pub mod characteristic;
pub mod client;
pub mod config;
pub mod scanner;
pub mod services;
pub mod session;
pub mod stream;

pub use ble::address::DeviceAddress;
pub use ble::char_uuid::CharUuid;
pub use ble::BleError;
pub use client::StreamClient;
pub use config::{ClientConfig, ConfigError};
pub use session::{ConnectionSession, SessionState};
pub use stream::ReadTimeout;
