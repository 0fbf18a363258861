//! Tunnel layer - framed UDP over pooled TLS connections
//!
//! Provides:
//! - Frame encoding and the per-connection frame reader
//! - The connection cache with dial cooldown
//! - The packet forwarder with bounded write retries

mod cache;
mod forwarder;
mod frame;
mod reader;

pub use cache::{CacheKey, ConnectionCache};
pub use forwarder::{PacketForwarder, MAX_WRITE_ATTEMPTS};
pub use frame::{
    now_nanos, Frame, FrameReader, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
    TIMESTAMP_SIZE,
};
pub use reader::{serve_connection, FrameService};

use crate::delivery::DeliveryError;
use crate::transport::{ConnectionReader, TransportError, TunnelConnection};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Reserved port in frame: {0}")]
    ReservedPort(u16),

    #[error("Connection {0} is cooling down after a failed dial")]
    CoolingDown(String),

    #[error("Dial to {key} failed: {source}")]
    Dial {
        key: String,
        #[source]
        source: TransportError,
    },

    #[error("Write failed after {attempts} attempt(s): {source}")]
    WriteFailed {
        attempts: usize,
        #[source]
        source: TransportError,
    },

    #[error("Connection cache stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

impl TunnelError {
    /// Cooldown errors are expected backpressure, not failures
    pub fn is_cooldown(&self) -> bool {
        matches!(self, TunnelError::CoolingDown(_))
    }
}

/// Takes over the read side of a freshly established connection
pub trait ConnectionHandler: Send + Sync {
    fn serve(&self, conn: Arc<TunnelConnection>, reader: ConnectionReader);
}

/// Default window during which redials to a failed key are refused
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
