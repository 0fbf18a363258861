//! Ingress pumps
//!
//! Provides:
//! - The UDP pump: decodes tunnel headers, delivers locally or forwards
//! - The TLS pump: accepts authenticated peers and hands them to the tunnel

mod tls;
mod udp;

pub use tls::TlsIngress;
pub use udp::UdpIngress;

use crate::delivery::DeliveryError;
use crate::protocol::TunnelHeader;
use crate::transport::{ConnectionReader, TunnelConnection};
use crate::tunnel::TunnelError;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Ingress errors. Any of these ends its pump.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("Delivery initialization failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Pump aborted: {0}")]
    Aborted(String),
}

/// What the pumps need from the tunnel
#[async_trait]
pub trait ConnectionDispatcher: Send + Sync {
    /// Frame `payload` and send it to the peer named in `header`
    async fn forward(
        &self,
        header: TunnelHeader,
        payload: Bytes,
        src_port: u16,
    ) -> Result<(), TunnelError>;

    /// Take ownership of an accepted, authenticated connection
    async fn handle_inbound(&self, conn: Arc<TunnelConnection>, reader: ConnectionReader);
}
