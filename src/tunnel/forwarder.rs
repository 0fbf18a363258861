//! Packet forwarder
//!
//! Frames a datagram and writes it to the cached connection for its
//! destination. A failed write evicts every connection to that destination
//! and retries on a fresh one, up to `MAX_WRITE_ATTEMPTS` writes.

use super::{now_nanos, CacheKey, ConnectionCache, Frame, TunnelError, MAX_PAYLOAD_SIZE};
use crate::protocol::TunnelHeader;
use crate::stats::ForwardStats;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Writes attempted per datagram before giving up
pub const MAX_WRITE_ATTEMPTS: usize = 3;

pub struct PacketForwarder {
    cache: Arc<ConnectionCache>,
    profiling: bool,
    stats: Arc<ForwardStats>,
}

impl PacketForwarder {
    pub fn new(cache: Arc<ConnectionCache>, profiling: bool, stats: Arc<ForwardStats>) -> Self {
        Self {
            cache,
            profiling,
            stats,
        }
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    /// Forward one datagram to the peer named in `header`.
    ///
    /// A frame the peer's reader would reject is dropped here instead of
    /// desynchronizing the shared connection.
    pub async fn forward(
        &self,
        header: TunnelHeader,
        payload: Bytes,
        src_port: u16,
    ) -> Result<(), TunnelError> {
        let mut frame = Frame::new(src_port, header.port, payload);
        if self.profiling {
            frame = frame.with_timestamp(now_nanos());
        }
        let body = frame.length_field() - 2;
        if body > MAX_PAYLOAD_SIZE {
            warn!(
                destination = %header.destination,
                dst_port = header.port,
                bytes = body,
                "Dropping datagram too large for a frame"
            );
            return Err(TunnelError::FrameTooLarge(body, MAX_PAYLOAD_SIZE));
        }
        let bytes = frame.encode()?;
        let key = CacheKey::for_header(&header);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let conn = match self.cache.get_or_dial(key).await {
                Ok(conn) => conn,
                Err(e) if e.is_cooldown() => {
                    debug!(%key, "Dropping datagram, peer is cooling down");
                    return Err(e);
                }
                Err(e) => {
                    error!(%key, error = %e, "No tunnel connection");
                    return Err(e);
                }
            };

            match conn.send(&bytes).await {
                Ok(()) => {
                    debug!(
                        %key,
                        conn_id = conn.id(),
                        src_port,
                        dst_port = header.port,
                        bytes = bytes.len(),
                        "Forwarded frame"
                    );
                    self.stats
                        .record("udp", format_args!("{}:{}", header.destination, header.port));
                    return Ok(());
                }
                Err(e) => {
                    warn!(%key, conn_id = conn.id(), attempt, error = %e, "Tunnel write failed");
                    self.cache.remove(header.destination).await;
                    if attempt >= MAX_WRITE_ATTEMPTS {
                        error!(%key, attempts = attempt, "Giving up on datagram");
                        return Err(TunnelError::WriteFailed {
                            attempts: attempt,
                            source: e,
                        });
                    }
                }
            }
        }
    }
}
