//! TLS transport with mutual authentication
//!
//! Both tunnel endpoints present a certificate and verify the peer against the
//! same configured trust roots. The server refuses clients without a valid
//! certificate; the client verifies the server under the destination IP.

use super::{ConnectionReader, Dialer, TransportConfig, TransportError, TunnelConnection};
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Certificate chain and private key presented by this endpoint
pub struct TlsIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::Identity(format!("Failed to open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::Identity(format!("Failed to parse PEM in {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(TransportError::Identity(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a PEM certificate chain and private key
pub fn load_identity(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsIdentity, TransportError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let certs = read_certs(cert_path)?;
    info!("Loaded {} certificate(s) from {}", certs.len(), cert_path.display());

    let mut reader = open(key_path)?;
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            TransportError::Identity(format!(
                "Failed to parse PEM private key in {}: {}",
                key_path.display(),
                e
            ))
        })?
        .ok_or_else(|| {
            TransportError::Identity(format!("No private key found in {}", key_path.display()))
        })?;

    Ok(TlsIdentity { certs, key })
}

/// Load the CA certificates that peers must chain to
pub fn load_trust_roots(ca_cert_path: impl AsRef<Path>) -> Result<RootCertStore, TransportError> {
    let ca_cert_path = ca_cert_path.as_ref();
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_cert_path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Identity(format!("Invalid CA certificate: {}", e)))?;
    }
    info!("Loaded {} trust root(s) from {}", roots.len(), ca_cert_path.display());
    Ok(roots)
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client side: verify the server against `roots` and present `identity`
pub fn client_config(
    identity: &TlsIdentity,
    roots: RootCertStore,
) -> Result<Arc<ClientConfig>, TransportError> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Server side: require a client certificate chaining to `roots`
pub fn server_config(
    identity: &TlsIdentity,
    roots: RootCertStore,
) -> Result<Arc<ServerConfig>, TransportError> {
    let provider = crypto_provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Dials tunnel peers over TLS
pub struct TlsDialer {
    connector: TlsConnector,
    config: TransportConfig,
}

impl TlsDialer {
    pub fn new(client_config: Arc<ClientConfig>, config: TransportConfig) -> Self {
        Self {
            connector: TlsConnector::from(client_config),
            config,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(
        &self,
        destination: IpAddr,
        source: Option<IpAddr>,
        port: u16,
    ) -> Result<(Arc<TunnelConnection>, ConnectionReader), TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);
        let remote = SocketAddr::new(destination, port);

        let socket = match destination {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(source) = source {
            socket.bind(SocketAddr::new(source, 0)).map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to bind {}: {}", source, e))
            })?;
        }

        let tcp_stream = tokio::time::timeout(timeout, socket.connect(remote))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", remote, e)))?;

        if self.config.nodelay {
            tcp_stream.set_nodelay(true).ok();
        }
        let peer_addr = tcp_stream.peer_addr()?;
        let local_addr = tcp_stream.local_addr()?;

        // The peer certificate must be issued for the destination IP
        let server_name = ServerName::from(destination);
        let handshake = self.connector.connect(server_name, tcp_stream);
        let tls_stream = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let session = tls_stream.get_ref().1;
        debug!(
            peer = %peer_addr,
            local = %local_addr,
            version = ?session.protocol_version(),
            cipher_suite = ?session.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS handshake complete"
        );

        let write_timeout = Duration::from_secs(self.config.write_timeout);
        Ok(TunnelConnection::with_write_timeout(
            tls_stream,
            peer_addr,
            local_addr,
            write_timeout,
        ))
    }
}
