//! Transport layer
//!
//! Provides:
//! - TLS identity and trust-root loading
//! - Client/server TLS configurations with mutual authentication
//! - A TLS dialer that can bind a specific source address
//! - The shared connection wrapper used by readers and writers

mod connection;
mod tls;

pub use connection::{ConnectionReader, TunnelConnection};
pub use tls::{
    client_config, load_identity, load_trust_roots, server_config, TlsDialer, TlsIdentity,
};

use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Opens outbound tunnel connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `destination:port`, optionally binding the local side to `source`
    async fn dial(
        &self,
        destination: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(Arc<TunnelConnection>, ConnectionReader), TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds (TCP connect and TLS handshake each)
    pub connect_timeout: u64,
    /// Write timeout in seconds, per frame
    pub write_timeout: u64,
    /// Disable Nagle's algorithm on tunnel sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            write_timeout: 60,
            nodelay: true,
        }
    }
}
