//! Shared tunnel connection
//!
//! A tunnel connection is written to by any number of forwarding tasks and
//! read by exactly one frame reader. The stream is split on creation: the
//! write half lives behind a mutex so frames are never interleaved, the read
//! half is handed to whoever services the connection.

use super::TransportError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

/// Read half of a tunnel connection
pub type ConnectionReader = Box<dyn AsyncRead + Send + Unpin>;

type ConnectionWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Write deadline used by [`TunnelConnection::new`]
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// A live tunnel connection (TLS in production, any byte stream in tests)
pub struct TunnelConnection {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<Option<ConnectionWriter>>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl TunnelConnection {
    /// Wrap an established stream, returning the shared handle and the read half
    pub fn new<S>(
        stream: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> (Arc<Self>, ConnectionReader)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_write_timeout(stream, peer_addr, local_addr, DEFAULT_WRITE_TIMEOUT)
    }

    /// Like [`TunnelConnection::new`], failing writes that take longer than `write_timeout`
    pub fn with_write_timeout<S>(
        stream: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        write_timeout: Duration,
    ) -> (Arc<Self>, ConnectionReader)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            local_addr,
            writer: Mutex::new(Some(Box::new(write_half))),
            write_timeout,
            closed,
        });

        (conn, Box::new(read_half))
    }

    /// Process-unique connection id (for logs)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote IP with IPv4-mapped addresses folded back to IPv4
    pub fn remote_ip(&self) -> IpAddr {
        self.peer_addr.ip().to_canonical()
    }

    /// Local IP with IPv4-mapped addresses folded back to IPv4
    pub fn local_ip(&self) -> IpAddr {
        self.local_addr.ip().to_canonical()
    }

    /// Check if the connection has been closed
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Write one complete buffer to the connection.
    ///
    /// Writers are serialized, so each call's bytes land contiguously on the stream.
    /// A write that misses the deadline leaves a partial frame behind, so the
    /// connection is closed and `TransportError::Timeout` returned.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(TransportError::Io),
            Err(_) => {
                self.closed.send_replace(true);
                // Dropping the write half releases the stream
                guard.take();
                Err(TransportError::Timeout)
            }
        }
    }

    /// Close the connection.
    ///
    /// Wakes the reader servicing this connection. If a write is in flight the
    /// write half is released when the last handle is dropped instead.
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let writer = match self.writer.try_lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
