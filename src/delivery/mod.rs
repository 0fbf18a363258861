//! Local delivery of tunnelled datagrams
//!
//! Provides:
//! - Raw IPv4 injection that preserves the original source address (Linux)
//! - Plain UDP sockets carrying the source address as a 6-byte prefix
//! - Selection of a backend per platform and configuration

mod packet;
#[cfg(target_os = "linux")]
mod raw;
mod socket;

pub use packet::{build_ipv4_udp, checksum, IPV4_HEADER_LEN, UDP_HEADER_LEN};
#[cfg(target_os = "linux")]
pub use raw::RawSocketDelivery;
pub use socket::{source_prefix, SocketDelivery, SOURCE_PREFIX_LEN};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Delivery errors
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Delivery backend not initialized")]
    NotInitialized,
}

/// Emits a UDP datagram on this host as if sent from `src_ip:src_port`
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    /// Acquire OS resources (privileged sockets). Called before any pump
    /// starts; repeated calls are no-ops.
    fn init(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn send_udp(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), DeliveryError>;
}

/// Which delivery backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Raw sockets where available, prefixed UDP elsewhere
    #[default]
    Auto,
    Raw,
    Socket,
}

/// Build the delivery backend for this platform
pub fn for_platform(mode: DeliveryMode) -> Result<Arc<dyn LocalDelivery>, DeliveryError> {
    let delivery: Arc<dyn LocalDelivery> = match mode {
        #[cfg(target_os = "linux")]
        DeliveryMode::Auto | DeliveryMode::Raw => Arc::new(RawSocketDelivery::new()),
        #[cfg(not(target_os = "linux"))]
        DeliveryMode::Auto => Arc::new(SocketDelivery::new()),
        #[cfg(not(target_os = "linux"))]
        DeliveryMode::Raw => {
            return Err(DeliveryError::Unsupported(
                "raw delivery is only available on Linux".into(),
            ))
        }
        DeliveryMode::Socket => Arc::new(SocketDelivery::new()),
    };
    info!("Local delivery: {:?}", mode);
    Ok(delivery)
}
