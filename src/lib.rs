//! # UDP-over-TLS Tunnel
//!
//! Carries local UDP datagrams across a mutually authenticated TLS tunnel to a
//! peer instance, which re-emits them as UDP on the far side.
//!
//! ## Features
//!
//! - **Mutual TLS** between tunnel endpoints (client certificates required)
//! - **Connection pooling** keyed by destination and optional source address
//! - **Dial cooldown** to avoid dial storms against unreachable peers
//! - **Raw-socket delivery** that preserves the original sender's address
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   header    ┌─────────────────┐   frames   ┌──────────────┐
//! │ UDP ingress  │ ──────────▶ │ Packet forwarder│ ─────────▶ │ Conn. cache  │
//! │  (:55555)    │             └─────────────────┘            │ (TLS dialer) │
//! └──────┬───────┘                                            └──────┬───────┘
//!        │ local destination                                         │ TLS
//!        ▼                                                           ▼
//! ┌──────────────┐   payload   ┌─────────────────┐   accept   ┌──────────────┐
//! │Local delivery│ ◀────────── │  Frame reader   │ ◀───────── │ TLS ingress  │
//! │ (raw / udp)  │             └─────────────────┘            │  (:55554)    │
//! └──────────────┘                                            └──────────────┘
//! ```

pub mod config;
pub mod delivery;
pub mod ingress;
pub mod local_addrs;
pub mod protocol;
pub mod service;
pub mod stats;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use service::{Pump, TunnelService};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default UDP ingress port
pub const DEFAULT_UDP_PORT: u16 = 55555;

/// Default TLS tunnel port (listen and dial)
pub const DEFAULT_TLS_PORT: u16 = 55554;

/// Ports that are never accepted as a source or destination
pub const RESERVED_PORTS: [u16; 2] = [0, 1023];

/// Working buffer size for a single datagram or frame
pub const BUFFER_SIZE: usize = 1024;

/// Returns true if `port` is one of [`RESERVED_PORTS`]
pub fn is_reserved_port(port: u16) -> bool {
    RESERVED_PORTS.contains(&port)
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] delivery::DeliveryError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] ingress::IngressError),

    #[error("Configuration error: {0}")]
    Config(String),
}
