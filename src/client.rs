//! Byte-pipe façade over one device
//!
//! [`StreamClient`] bundles a [`ConnectionSession`] with the reader side of
//! its notification stream and applies the timeouts from a
//! [`ClientConfig`]. It is the API a command/response protocol sits on:
//! `connect`, `write` a command, `read` exactly as many response bytes as
//! the protocol expects, `close`.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::Mutex;

use crate::ble::transport::Transport;
use crate::ble::BleError;
use crate::config::{ClientConfig, ConfigError};
use crate::session::ConnectionSession;
use crate::stream::adapter::{self, ByteStreamAdapter, ReadTimeout};

pub struct StreamClient {
    config: ClientConfig,
    session: ConnectionSession,
    reader: Mutex<ByteStreamAdapter>,
}

impl StreamClient {
    /// Validates `config` and prepares an idle client. Nothing is sent to
    /// the transport until [`connect`](Self::connect).
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self, ConfigError> {
        let session = ConnectionSession::from_config(transport, &config)?;
        let reader = Mutex::new(ByteStreamAdapter::new(Arc::clone(session.queue())));
        Ok(Self {
            config,
            session,
            reader,
        })
    }

    /// The validated configuration this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Find and connect to the configured device.
    ///
    /// A new link starts with an empty stream: bytes left unread from a
    /// previous link are dropped.
    pub async fn connect(&self) -> Result<(), BleError> {
        if !self.session.is_connected() {
            let discarded = self.reader.lock().await.discard_held();
            if discarded > 0 {
                debug!("Dropped {} unread bytes from the previous link", discarded);
            }
        }
        self.session.connect(self.config.connect_timeout()).await?;
        Ok(())
    }

    /// Disable notifications and disconnect. A no-op on an idle client.
    pub async fn close(&self) -> Result<(), BleError> {
        if !self.session.is_connected() {
            return Ok(());
        }
        self.session
            .disconnect(self.config.disconnect_timeout())
            .await?;
        info!("Connection to {} closed", self.config.address);
        Ok(())
    }

    /// Send a command; the service is picked from the payload's marker.
    pub async fn write(&self, payload: &[u8]) -> Result<usize, BleError> {
        self.session
            .io()
            .write(payload, self.config.write_timeout())
            .await
    }

    /// Read `n` bytes under the configured read timeout.
    pub async fn read(&self, n: usize) -> Vec<u8> {
        self.read_with(n, self.config.read_timeout()).await
    }

    /// Read `n` bytes under an explicit timeout policy.
    ///
    /// Concurrent readers are served one after the other.
    pub async fn read_with(&self, n: usize, timeout: ReadTimeout) -> Vec<u8> {
        self.reader.lock().await.read(n, timeout).await
    }

    /// Everything queued right now; never waits, not even for a reader.
    pub fn read_all(&self) -> Vec<u8> {
        adapter::drain_bytes(self.session.queue())
    }
}
