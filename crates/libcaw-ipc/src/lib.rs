//! IPC client for the Code Awareness local service
//!
//! This crate provides:
//! - The wire frame and its delimiter framing (Frame, FrameBuffer)
//! - A reconnecting socket transport (Transport)
//! - Request/response correlation with timeouts (Correlator)
//! - Server-pushed event routing (EventMultiplexer, Event)
//! - The client tying them together (CawClient)

pub mod actions;
pub mod client;
pub mod correlator;
pub mod error;
pub mod events;
pub mod frame;
pub mod transport;

#[cfg(all(unix, any(test, feature = "mock-service")))]
pub mod mock;

pub use client::{CawClient, ClientConfig, TransmitOptions};
pub use correlator::{CorrelationKey, Correlator};
pub use error::IpcError;
pub use events::{Delivery, Event, EventKind, EventMultiplexer};
pub use frame::{Flow, Frame, FrameBuffer};
pub use transport::{ConnectionState, Transport, TransportConfig};

/// Default request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

/// Byte written after every serialized frame (form feed)
pub const FRAME_DELIMITER: u8 = 0x0C;

/// Largest frame accepted before the receive buffer is discarded
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Domain used by the auth actions
pub const WILDCARD_DOMAIN: &str = "*";

/// Domain used by every other action
pub const CODE_DOMAIN: &str = "code";

/// Session value that addresses every connected editor
pub const BROADCAST_SESSION: &str = "*";
