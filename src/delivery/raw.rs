//! Raw IPv4 injection
//!
//! Builds the IP and UDP headers by hand so the packet carries the original
//! sender's address. Needs CAP_NET_RAW.

use super::{build_ipv4_udp, DeliveryError, LocalDelivery};
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tracing::{info, trace};

const IPPROTO_RAW: i32 = 255;

/// Delivers datagrams through a raw IPv4 socket with `IP_HDRINCL`
#[derive(Debug, Default)]
pub struct RawSocketDelivery {
    socket: OnceLock<Arc<Socket>>,
}

impl RawSocketDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    fn open() -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))?;
        socket.set_header_included(true)?;
        Ok(socket)
    }
}

#[async_trait]
impl LocalDelivery for RawSocketDelivery {
    fn init(&self) -> Result<(), DeliveryError> {
        if self.socket.get().is_some() {
            return Ok(());
        }
        let socket = Self::open()?;
        if self.socket.set(Arc::new(socket)).is_ok() {
            info!("Raw delivery socket opened");
        }
        Ok(())
    }

    async fn send_udp(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), DeliveryError> {
        let (src, dst) = match (src_ip.to_canonical(), dst_ip.to_canonical()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => (src, dst),
            _ => {
                return Err(DeliveryError::Unsupported(format!(
                    "raw delivery needs IPv4 addresses, got {} -> {}",
                    src_ip, dst_ip
                )))
            }
        };
        let socket = self.socket.get().cloned().ok_or(DeliveryError::NotInitialized)?;

        let packet = build_ipv4_udp(src, dst, src_port, dst_port, payload)?;
        let target = SockAddr::from(SocketAddr::new(IpAddr::V4(dst), 0));

        let sent = tokio::task::spawn_blocking(move || socket.send_to(&packet, &target))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        trace!(%src, %dst, src_port, dst_port, bytes = sent, "Injected datagram");
        Ok(())
    }
}
