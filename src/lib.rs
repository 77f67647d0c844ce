//! Async Rust client for Bluetooth LE standing desks that speak the
//! `F1 F1 .. 7E` controller protocol.
//!
//! The recommended API surface is:
//! - [`DeskSession`] for commands, height queries and telemetry events
//! - [`transport`] for the link boundary and the btleplug adapter
//! - [`protocol`] for frame-level encoding and notification decoding

/// Raw frame layout, checksum and structural parsing.
pub mod framing;
/// Desk commands and notification decoding.
pub mod protocol;
mod session;
/// Transport adapters for reaching a desk.
pub mod transport;

pub use framing::FramingError;
pub use protocol::{DecodedNotification, DeskCommand, DeskOperation};
pub use session::{
    DEFAULT_CONNECT_ATTEMPTS, DEFAULT_HEIGHT_TOLERANCE_MM, DEFAULT_QUERY_TIMEOUT, DeskConfig,
    DeskError, DeskEvent, DeskSession, DeskState, MAX_HEIGHT_MM, MIN_HEIGHT_MM,
};
pub use transport::{Transport, TransportError};
