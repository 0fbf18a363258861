//! Prefixed UDP delivery
//!
//! For hosts without raw sockets: the datagram goes out from an ephemeral
//! local socket and the original source travels in front of the payload.
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+---------
//! |        Source IPv4 (4B)           | Src port (2B)   | Payload
//! +--------+--------+--------+--------+--------+--------+---------
//! ```

use super::{DeliveryError, LocalDelivery};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tracing::trace;

pub const SOURCE_PREFIX_LEN: usize = 6;

/// Source prefix: last four bytes of the source address, then the port
pub fn source_prefix(src_ip: IpAddr, src_port: u16) -> [u8; SOURCE_PREFIX_LEN] {
    let octets = match src_ip.to_canonical() {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            [o[12], o[13], o[14], o[15]]
        }
    };
    let port = src_port.to_be_bytes();
    [octets[0], octets[1], octets[2], octets[3], port[0], port[1]]
}

/// Delivers through ordinary UDP sockets, one per address family
#[derive(Debug, Default)]
pub struct SocketDelivery {
    v4: OnceCell<UdpSocket>,
    v6: OnceCell<UdpSocket>,
}

impl SocketDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    async fn socket_for(&self, dst_ip: IpAddr) -> Result<&UdpSocket, DeliveryError> {
        let (cell, bind) = match dst_ip {
            IpAddr::V4(_) => (&self.v4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            IpAddr::V6(_) => (&self.v6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
        };
        let socket = cell.get_or_try_init(|| UdpSocket::bind(bind)).await?;
        Ok(socket)
    }
}

#[async_trait]
impl LocalDelivery for SocketDelivery {
    async fn send_udp(
        &self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), DeliveryError> {
        let dst_ip = dst_ip.to_canonical();
        let socket = self.socket_for(dst_ip).await?;

        let mut datagram = Vec::with_capacity(SOURCE_PREFIX_LEN + payload.len());
        datagram.extend_from_slice(&source_prefix(src_ip, src_port));
        datagram.extend_from_slice(payload);

        socket.send_to(&datagram, (dst_ip, dst_port)).await?;
        trace!(%src_ip, %dst_ip, src_port, dst_port, "Delivered prefixed datagram");
        Ok(())
    }
}
