//! Per-connection frame reader
//!
//! Exactly one reader task per tunnel connection. It reconstructs frames and
//! hands each payload to local delivery with the connection's remote IP as
//! source and its local IP as destination.

use super::{now_nanos, ConnectionHandler, FrameReader, TunnelError};
use crate::delivery::LocalDelivery;
use crate::stats::ForwardStats;
use crate::transport::{ConnectionReader, TunnelConnection};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Spawns a frame reader for every connection it is given
pub struct FrameService {
    delivery: Arc<dyn LocalDelivery>,
    profiling: bool,
    stats: Arc<ForwardStats>,
}

impl FrameService {
    pub fn new(
        delivery: Arc<dyn LocalDelivery>,
        profiling: bool,
        stats: Arc<ForwardStats>,
    ) -> Self {
        Self {
            delivery,
            profiling,
            stats,
        }
    }
}

impl ConnectionHandler for FrameService {
    fn serve(&self, conn: Arc<TunnelConnection>, reader: ConnectionReader) {
        let delivery = self.delivery.clone();
        let stats = self.stats.clone();
        let profiling = self.profiling;

        tokio::spawn(async move {
            let _ = serve_connection(conn, reader, delivery, profiling, stats).await;
        });
    }
}

/// Read frames from `conn` until it closes or a frame cannot be read or delivered.
///
/// The connection is always closed on return.
pub async fn serve_connection(
    conn: Arc<TunnelConnection>,
    reader: ConnectionReader,
    delivery: Arc<dyn LocalDelivery>,
    profiling: bool,
    stats: Arc<ForwardStats>,
) -> Result<(), TunnelError> {
    let remote_ip = conn.remote_ip();
    let local_ip = conn.local_ip();
    info!(conn_id = conn.id(), peer = %conn.peer_addr(), "Frame reader started");

    let mut frames = FrameReader::new(reader, profiling);
    let result = loop {
        let next = tokio::select! {
            _ = conn.closed() => break Ok(()),
            next = frames.next_frame() => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        if let Some(sent_at) = frame.sent_at {
            trace!(
                conn_id = conn.id(),
                latency_ns = now_nanos().saturating_sub(sent_at),
                "Frame latency"
            );
        }

        if let Err(e) = delivery
            .send_udp(remote_ip, local_ip, frame.src_port, frame.dst_port, &frame.payload)
            .await
        {
            error!(
                conn_id = conn.id(),
                src_port = frame.src_port,
                dst_port = frame.dst_port,
                error = %e,
                "Local delivery failed"
            );
            break Err(TunnelError::Delivery(e));
        }
        stats.record("tls", format_args!("{}-{}", remote_ip, frame.dst_port));
    };

    conn.close().await;
    match &result {
        Ok(()) => debug!(conn_id = conn.id(), "Frame reader finished"),
        Err(e) => warn!(conn_id = conn.id(), error = %e, "Frame reader stopped"),
    }
    result
}
