//! Link-layer boundary between a [`crate::DeskSession`] and the radio.
//!
//! A [`Transport`] resolves a desk by address and opens a [`Connection`] to
//! it. Inbound notification bytes are pushed into a [`NotificationSink`];
//! the session drains that channel on its own task.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[cfg(feature = "ble")]
pub mod ble;

/// Channel a connection pushes raw notification buffers into.
pub type NotificationSink = UnboundedSender<Vec<u8>>;

/// Whether a write asks the peripheral for a link-layer acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[cfg(feature = "ble")]
    #[error("ble error: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("characteristic {0} not found on peripheral")]
    MissingCharacteristic(String),
    #[error("link is not connected")]
    NotConnected,
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Current addressable handle for a desk. This may change between
    /// connects when the desk roams between adapters or proxies.
    type Device: Send + Sync;
    type Connection: Connection;

    /// Returns `None` when the desk is not currently reachable.
    async fn resolve(&self, address: &str) -> Result<Option<Self::Device>, TransportError>;

    async fn connect(&self, device: &Self::Device) -> Result<Self::Connection, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn subscribe(&self, sink: NotificationSink) -> Result<(), TransportError>;

    async fn write(&self, data: &[u8], mode: WriteMode) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
