//! UDP ingress pump

use super::{ConnectionDispatcher, IngressError};
use crate::delivery::LocalDelivery;
use crate::local_addrs::LocalAddrs;
use crate::protocol::TunnelHeader;
use crate::stats::ForwardStats;
use crate::{is_reserved_port, BUFFER_SIZE};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Reads headered datagrams from the local UDP port
pub struct UdpIngress {
    socket: UdpSocket,
    dispatcher: Arc<dyn ConnectionDispatcher>,
    delivery: Arc<dyn LocalDelivery>,
    local_addrs: Arc<dyn LocalAddrs>,
    stats: Arc<ForwardStats>,
}

impl UdpIngress {
    pub fn new(
        socket: UdpSocket,
        dispatcher: Arc<dyn ConnectionDispatcher>,
        delivery: Arc<dyn LocalDelivery>,
        local_addrs: Arc<dyn LocalAddrs>,
        stats: Arc<ForwardStats>,
    ) -> Self {
        Self {
            socket,
            dispatcher,
            delivery,
            local_addrs,
            stats,
        }
    }

    /// Run until `shutdown` flips to true or the socket fails
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), IngressError> {
        let mut buf = [0u8; BUFFER_SIZE];
        if let Ok(addr) = self.socket.local_addr() {
            info!("UDP ingress listening on {}", addr);
        }

        loop {
            let (len, src) = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("UDP ingress shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                        return Err(IngressError::Recv(e));
                    }
                },
            };

            self.handle_datagram(&buf[..len], src).await;
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let (header, payload) = match TunnelHeader::decode(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", src, e);
                return;
            }
        };
        if is_reserved_port(header.port) {
            warn!("Dropping datagram from {} for reserved port {}", src, header.port);
            return;
        }

        let is_local = match self.local_addrs.is_local(header.destination) {
            Ok(is_local) => is_local,
            Err(e) => {
                error!("Local address lookup failed: {}", e);
                return;
            }
        };

        if is_local {
            debug!(
                "Delivering {} bytes locally to {}:{}",
                payload.len(),
                header.destination,
                header.port
            );
            let src_ip = src.ip().to_canonical();
            if let Err(e) = self
                .delivery
                .send_udp(src_ip, header.destination, src.port(), header.port, payload)
                .await
            {
                error!("Local delivery to {}:{} failed: {}", header.destination, header.port, e);
            }
            return;
        }

        self.stats
            .record("udp-in", format_args!("{}:{}", header.destination, header.port));

        // Forwarding may dial; the pump keeps reading meanwhile
        let dispatcher = self.dispatcher.clone();
        let payload = Bytes::copy_from_slice(payload);
        let src_port = src.port();
        tokio::spawn(async move {
            let _ = dispatcher.forward(header, payload, src_port).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryError;
    use crate::local_addrs::StaticAddrs;
    use crate::transport::{ConnectionReader, TunnelConnection};
    use crate::tunnel::TunnelError;
    use async_trait::async_trait;
    use bytes::{BufMut, BytesMut};
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ChannelDispatcher {
        tx: mpsc::UnboundedSender<(TunnelHeader, Bytes, u16)>,
    }

    #[async_trait]
    impl ConnectionDispatcher for ChannelDispatcher {
        async fn forward(
            &self,
            header: TunnelHeader,
            payload: Bytes,
            src_port: u16,
        ) -> Result<(), TunnelError> {
            let _ = self.tx.send((header, payload, src_port));
            Ok(())
        }

        async fn handle_inbound(&self, _conn: Arc<TunnelConnection>, _reader: ConnectionReader) {}
    }

    struct NoDelivery;

    #[async_trait]
    impl LocalDelivery for NoDelivery {
        async fn send_udp(
            &self,
            _src_ip: IpAddr,
            _dst_ip: IpAddr,
            _src_port: u16,
            _dst_port: u16,
            _payload: &[u8],
        ) -> Result<(), DeliveryError> {
            Err(DeliveryError::Unsupported("no local delivery in this test".into()))
        }
    }

    fn datagram(port: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        TunnelHeader::new(IpAddr::from([192, 168, 1, 50]), port)
            .encode_into(&mut buf)
            .unwrap();
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_reserved_ports_are_not_forwarded() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ingress = UdpIngress::new(
            socket,
            Arc::new(ChannelDispatcher { tx }),
            Arc::new(NoDelivery),
            Arc::new(StaticAddrs::default()),
            Arc::new(ForwardStats::disabled()),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(ingress.run(shutdown_rx));

        let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let app_port = app.local_addr().unwrap().port();
        for packet in [
            datagram(0, b"zero"),
            datagram(1023, b"reserved"),
            vec![0x75, 0x01],
            datagram(92, &[10, 9, 8]),
        ] {
            app.send_to(&packet, addr).await.unwrap();
        }

        let (header, payload, src_port) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header.port, 92);
        assert_eq!(header.destination, IpAddr::from([192, 168, 1, 50]));
        assert_eq!(&payload[..], &[10, 9, 8]);
        assert_eq!(src_port, app_port);
        assert!(rx.try_recv().is_err());

        shutdown_tx.send_replace(true);
        assert!(pump.await.unwrap().is_ok());
    }
}
