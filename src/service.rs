//! Tunnel service
//!
//! Owns the connection cache, the forwarder and the frame readers, and
//! starts the ingress pumps that feed them. Shutdown stops the pumps and
//! closes every cached connection.

use crate::config::TunnelConfig;
use crate::delivery::LocalDelivery;
use crate::ingress::{ConnectionDispatcher, IngressError, TlsIngress, UdpIngress};
use crate::local_addrs::LocalAddrs;
use crate::protocol::TunnelHeader;
use crate::stats::ForwardStats;
use crate::transport::{ConnectionReader, Dialer, TlsDialer, TransportConfig, TunnelConnection};
use crate::tunnel::{
    ConnectionCache, ConnectionHandler, FrameService, PacketForwarder, TunnelError,
    DEFAULT_COOLDOWN,
};
use crate::DEFAULT_TLS_PORT;
use async_trait::async_trait;
use bytes::Bytes;
use rustls::{ClientConfig, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// Runtime options for a tunnel service
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Port dialed on remote peers
    pub remote_tls_port: u16,
    pub cooldown: Duration,
    pub transport: TransportConfig,
    pub handshake_timeout: Duration,
    pub net_profiling: bool,
    pub forward_stats: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            remote_tls_port: DEFAULT_TLS_PORT,
            cooldown: DEFAULT_COOLDOWN,
            handshake_timeout: Duration::from_secs(transport.connect_timeout),
            transport,
            net_profiling: false,
            forward_stats: false,
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &TunnelConfig) -> Self {
        let transport = TransportConfig {
            connect_timeout: config.connect_timeout_secs,
            write_timeout: config.write_timeout_secs,
            ..Default::default()
        };
        Self {
            remote_tls_port: config.remote_tls_port,
            cooldown: Duration::from_secs(config.cooldown_secs),
            handshake_timeout: Duration::from_secs(config.connect_timeout_secs),
            transport,
            net_profiling: config.net_profiling,
            forward_stats: config.forward_stats,
        }
    }
}

/// A running ingress pump
pub struct Pump {
    name: &'static str,
    local_addr: SocketAddr,
    handle: JoinHandle<Result<(), IngressError>>,
}

impl Pump {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Address the pump is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the pump to end
    pub async fn wait(self) -> Result<(), IngressError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(IngressError::Aborted(e.to_string())),
        }
    }
}

pub struct TunnelService {
    cache: Arc<ConnectionCache>,
    forwarder: PacketForwarder,
    frames: Arc<FrameService>,
    delivery: Arc<dyn LocalDelivery>,
    local_addrs: Arc<dyn LocalAddrs>,
    stats: Arc<ForwardStats>,
    options: ServiceOptions,
    shutdown: watch::Sender<bool>,
}

impl TunnelService {
    /// Service dialing peers over TLS with `client_tls`
    pub fn new(
        options: ServiceOptions,
        client_tls: Arc<ClientConfig>,
        delivery: Arc<dyn LocalDelivery>,
        local_addrs: Arc<dyn LocalAddrs>,
    ) -> Arc<Self> {
        let dialer = Arc::new(TlsDialer::new(client_tls, options.transport.clone()));
        Self::with_dialer(options, dialer, delivery, local_addrs)
    }

    pub fn with_dialer(
        options: ServiceOptions,
        dialer: Arc<dyn Dialer>,
        delivery: Arc<dyn LocalDelivery>,
        local_addrs: Arc<dyn LocalAddrs>,
    ) -> Arc<Self> {
        let stats = Arc::new(ForwardStats::new(options.forward_stats));
        let frames = Arc::new(FrameService::new(
            delivery.clone(),
            options.net_profiling,
            stats.clone(),
        ));
        let cache = Arc::new(ConnectionCache::new(
            dialer,
            frames.clone() as Arc<dyn ConnectionHandler>,
            options.remote_tls_port,
            options.cooldown,
        ));
        let forwarder = PacketForwarder::new(cache.clone(), options.net_profiling, stats.clone());
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            cache,
            forwarder,
            frames,
            delivery,
            local_addrs,
            stats,
            options,
            shutdown,
        })
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    fn init_delivery(&self) -> Result<(), IngressError> {
        self.delivery.init().map_err(|e| {
            error!("Failed to initialize local delivery: {}", e);
            IngressError::Delivery(e)
        })
    }

    /// Bind the UDP port and start reading datagrams
    pub async fn start_udp_ingress(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
    ) -> Result<Pump, IngressError> {
        self.init_delivery()?;
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| IngressError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| IngressError::Bind {
            addr: bind_addr,
            source,
        })?;

        let ingress = UdpIngress::new(
            socket,
            self.clone(),
            self.delivery.clone(),
            self.local_addrs.clone(),
            self.stats.clone(),
        );
        let handle = tokio::spawn(ingress.run(self.shutdown.subscribe()));

        Ok(Pump {
            name: "udp-ingress",
            local_addr,
            handle,
        })
    }

    /// Bind the TLS port and start accepting peers
    pub async fn start_tls_ingress(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
        server_tls: Arc<ServerConfig>,
    ) -> Result<Pump, IngressError> {
        self.init_delivery()?;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| IngressError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| IngressError::Bind {
            addr: bind_addr,
            source,
        })?;

        let ingress = TlsIngress::new(
            listener,
            TlsAcceptor::from(server_tls),
            self.clone(),
            self.options.handshake_timeout,
            Duration::from_secs(self.options.transport.write_timeout),
        );
        let handle = tokio::spawn(ingress.run(self.shutdown.subscribe()));

        Ok(Pump {
            name: "tls-ingress",
            local_addr,
            handle,
        })
    }

    /// Stop the pumps and close every cached connection
    pub async fn shutdown(&self) {
        info!("Shutting down tunnel service");
        self.shutdown.send_replace(true);
        self.cache.stop_all().await;
    }
}

#[async_trait]
impl ConnectionDispatcher for TunnelService {
    async fn forward(
        &self,
        header: TunnelHeader,
        payload: Bytes,
        src_port: u16,
    ) -> Result<(), TunnelError> {
        self.forwarder.forward(header, payload, src_port).await
    }

    async fn handle_inbound(&self, conn: Arc<TunnelConnection>, reader: ConnectionReader) {
        self.cache.register_inbound(conn.clone()).await;
        if conn.is_closed() {
            return;
        }
        self.frames.serve(conn, reader);
    }
}
