//! TLS ingress pump

use super::{ConnectionDispatcher, IngressError};
use crate::transport::TunnelConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Accepts mutually authenticated tunnel peers
pub struct TlsIngress {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dispatcher: Arc<dyn ConnectionDispatcher>,
    handshake_timeout: Duration,
    write_timeout: Duration,
}

impl TlsIngress {
    pub fn new(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        dispatcher: Arc<dyn ConnectionDispatcher>,
        handshake_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            acceptor,
            dispatcher,
            handshake_timeout,
            write_timeout,
        }
    }

    /// Run until `shutdown` flips to true or accepting fails
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), IngressError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("TLS ingress listening on {}", addr);
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("TLS ingress shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        return Err(IngressError::Accept(e));
                    }
                },
            };
            debug!("New connection from {}", peer_addr);

            let acceptor = self.acceptor.clone();
            let dispatcher = self.dispatcher.clone();
            let handshake_timeout = self.handshake_timeout;
            let write_timeout = self.write_timeout;
            tokio::spawn(async move {
                stream.set_nodelay(true).ok();
                let local_addr = match stream.local_addr() {
                    Ok(addr) => addr,
                    Err(e) => {
                        warn!("Dropping connection from {}: {}", peer_addr, e);
                        return;
                    }
                };

                let tls_stream =
                    match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => tls_stream,
                        Ok(Err(e)) => {
                            warn!("TLS handshake with {} failed: {}", peer_addr, e);
                            return;
                        }
                        Err(_) => {
                            warn!("TLS handshake with {} timed out", peer_addr);
                            return;
                        }
                    };

                info!("Tunnel peer connected: {}", peer_addr);
                let (conn, reader) = TunnelConnection::with_write_timeout(
                    tls_stream,
                    peer_addr,
                    local_addr,
                    write_timeout,
                );
                dispatcher.handle_inbound(conn, reader).await;
            });
        }
    }
}
