//! Connection cache
//!
//! One live tunnel connection per (destination, source) key, shared by every
//! forwarding task. Each key owns a slot guarded by an async mutex so at most
//! one dial per key is in flight; a failed dial puts the key into cooldown.

use super::{ConnectionHandler, TunnelError};
use crate::protocol::TunnelHeader;
use crate::transport::{Dialer, TunnelConnection};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cache key: destination plus optional source binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub destination: IpAddr,
    pub source: Option<IpAddr>,
}

impl CacheKey {
    pub fn new(destination: IpAddr, source: Option<IpAddr>) -> Self {
        Self {
            destination,
            source,
        }
    }

    pub fn for_header(header: &TunnelHeader) -> Self {
        Self::new(header.destination, header.source)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            Some(source) => write!(f, "{}|{}", self.destination, source),
            None => write!(f, "{}|", self.destination),
        }
    }
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<TunnelConnection>>,
    last_failure: Option<Instant>,
}

impl Slot {
    /// Live connection, discarding one that has since closed
    fn live(&mut self) -> Option<Arc<TunnelConnection>> {
        match &self.conn {
            Some(conn) if !conn.is_closed() => Some(conn.clone()),
            Some(_) => {
                self.conn = None;
                None
            }
            None => None,
        }
    }
}

/// Pool of tunnel connections keyed by destination and source
pub struct ConnectionCache {
    slots: RwLock<HashMap<CacheKey, Arc<Mutex<Slot>>>>,
    dialer: Arc<dyn Dialer>,
    handler: Arc<dyn ConnectionHandler>,
    remote_port: u16,
    cooldown: Duration,
    stopped: AtomicBool,
}

impl ConnectionCache {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        handler: Arc<dyn ConnectionHandler>,
        remote_port: u16,
        cooldown: Duration,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            dialer,
            handler,
            remote_port,
            cooldown,
            stopped: AtomicBool::new(false),
        }
    }

    fn slot(&self, key: CacheKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().get(&key) {
            return slot.clone();
        }
        self.slots.write().entry(key).or_default().clone()
    }

    fn slots_where(&self, pred: impl Fn(&CacheKey) -> bool) -> Vec<(CacheKey, Arc<Mutex<Slot>>)> {
        self.slots
            .read()
            .iter()
            .filter(|(key, _)| pred(key))
            .map(|(key, slot)| (*key, slot.clone()))
            .collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Return the live connection for `key`, dialing one if needed.
    ///
    /// A fresh connection is handed to the frame handler before it is returned.
    /// Within the cooldown window after a failed dial no new dial is attempted.
    pub async fn get_or_dial(&self, key: CacheKey) -> Result<Arc<TunnelConnection>, TunnelError> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;

        if self.is_stopped() {
            return Err(TunnelError::Stopped);
        }
        if let Some(conn) = slot.live() {
            return Ok(conn);
        }
        if let Some(failed_at) = slot.last_failure {
            if failed_at.elapsed() < self.cooldown {
                return Err(TunnelError::CoolingDown(key.to_string()));
            }
        }

        info!(%key, port = self.remote_port, "Dialing tunnel connection");
        match self
            .dialer
            .dial(key.destination, key.source, self.remote_port)
            .await
        {
            Ok((conn, reader)) => {
                debug!(%key, conn_id = conn.id(), local = %conn.local_addr(), "Connection cached");
                slot.conn = Some(conn.clone());
                slot.last_failure = None;
                self.handler.serve(conn.clone(), reader);
                Ok(conn)
            }
            Err(e) => {
                slot.last_failure = Some(Instant::now());
                Err(TunnelError::Dial {
                    key: key.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Cache an accepted connection under `remote|local` and `remote|`.
    ///
    /// Slots holding a live connection are left untouched.
    pub async fn register_inbound(&self, conn: Arc<TunnelConnection>) {
        if self.is_stopped() {
            conn.close().await;
            return;
        }

        let remote = conn.remote_ip();
        let keys = [
            CacheKey::new(remote, Some(conn.local_ip())),
            CacheKey::new(remote, None),
        ];
        for key in keys {
            let slot = self.slot(key);
            let mut slot = slot.lock().await;
            if slot.live().is_some() {
                debug!(%key, "Keeping existing connection");
                continue;
            }
            debug!(%key, conn_id = conn.id(), "Caching inbound connection");
            slot.conn = Some(conn.clone());
        }
    }

    /// Close and evict every connection to `destination`, whatever the source
    pub async fn remove(&self, destination: IpAddr) {
        for (key, slot) in self.slots_where(|key| key.destination == destination) {
            let conn = slot.lock().await.conn.take();
            if let Some(conn) = conn {
                warn!(%key, conn_id = conn.id(), "Evicting connection");
                conn.close().await;
            }
        }
    }

    /// Live connection for `key` without dialing
    pub async fn get(&self, key: CacheKey) -> Option<Arc<TunnelConnection>> {
        let slot = self.slots.read().get(&key).cloned()?;
        let mut slot = slot.lock().await;
        slot.live()
    }

    /// Number of keys currently holding a live connection
    pub async fn len(&self) -> usize {
        let mut live = 0;
        for (_, slot) in self.slots_where(|_| true) {
            if slot.lock().await.live().is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close every cached connection and refuse further dials
    pub async fn stop_all(&self) {
        self.stopped.store(true, Ordering::Release);

        let slots = self.slots_where(|_| true);
        let mut closed = 0;
        for (_, slot) in slots {
            let conn = slot.lock().await.conn.take();
            if let Some(conn) = conn {
                conn.close().await;
                closed += 1;
            }
        }
        self.slots.write().clear();
        info!("Connection cache stopped, closed {} connection(s)", closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionReader, TransportError};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct MockDialer {
        dials: AtomicUsize,
        fail: AtomicBool,
        peers: parking_lot::Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(
            &self,
            destination: IpAddr,
            _source: Option<IpAddr>,
            port: u16,
        ) -> Result<(Arc<TunnelConnection>, ConnectionReader), TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("refused".into()));
            }
            let (ours, theirs) = tokio::io::duplex(4096);
            self.peers.lock().push(theirs);
            let local: SocketAddr = "10.0.0.1:40000".parse().unwrap();
            Ok(TunnelConnection::new(ours, SocketAddr::new(destination, port), local))
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        served: AtomicUsize,
    }

    impl ConnectionHandler for CountingHandler {
        fn serve(&self, _conn: Arc<TunnelConnection>, _reader: ConnectionReader) {
            self.served.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache(dialer: Arc<MockDialer>, handler: Arc<CountingHandler>) -> ConnectionCache {
        ConnectionCache::new(dialer, handler, 55554, Duration::from_secs(10))
    }

    fn key(dest: [u8; 4], source: Option<[u8; 4]>) -> CacheKey {
        CacheKey::new(IpAddr::from(dest), source.map(IpAddr::from))
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key([10, 0, 0, 2], None).to_string(), "10.0.0.2|");
        assert_eq!(
            key([10, 0, 0, 2], Some([10, 0, 0, 1])).to_string(),
            "10.0.0.2|10.0.0.1"
        );
    }

    #[tokio::test]
    async fn test_reuses_cached_connection() {
        let dialer = Arc::new(MockDialer::default());
        let handler = Arc::new(CountingHandler::default());
        let cache = cache(dialer.clone(), handler.clone());

        let first = cache.get_or_dial(key([10, 0, 0, 2], None)).await.unwrap();
        let second = cache.get_or_dial(key([10, 0, 0, 2], None)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(handler.served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_source_binding_is_a_separate_key() {
        let dialer = Arc::new(MockDialer::default());
        let cache = cache(dialer.clone(), Arc::new(CountingHandler::default()));

        let unbound = cache.get_or_dial(key([10, 0, 0, 2], None)).await.unwrap();
        let bound = cache
            .get_or_dial(key([10, 0, 0, 2], Some([10, 0, 0, 1])))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&unbound, &bound));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_dial() {
        let dialer = Arc::new(MockDialer::default());
        let cache = Arc::new(cache(dialer.clone(), Arc::new(CountingHandler::default())));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.get_or_dial(key([10, 0, 0, 2], None)).await.unwrap()
            }));
        }
        let conns = join_all(tasks).await;

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    async fn join_all(
        tasks: Vec<tokio::task::JoinHandle<Arc<TunnelConnection>>>,
    ) -> Vec<Arc<TunnelConnection>> {
        let mut out = Vec::new();
        for task in tasks {
            out.push(task.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_failed_dial_enters_cooldown() {
        let dialer = Arc::new(MockDialer::default());
        dialer.fail.store(true, Ordering::SeqCst);
        let cache = ConnectionCache::new(
            dialer.clone(),
            Arc::new(CountingHandler::default()),
            55554,
            Duration::from_millis(100),
        );
        let target = key([10, 0, 0, 9], None);

        assert!(matches!(
            cache.get_or_dial(target).await,
            Err(TunnelError::Dial { .. })
        ));
        let err = cache.get_or_dial(target).await.unwrap_err();
        assert!(err.is_cooldown());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        dialer.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(cache.get_or_dial(target).await.is_ok());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_connection_is_redialed() {
        let dialer = Arc::new(MockDialer::default());
        let cache = cache(dialer.clone(), Arc::new(CountingHandler::default()));
        let target = key([10, 0, 0, 2], None);

        let first = cache.get_or_dial(target).await.unwrap();
        first.close().await;
        let second = cache.get_or_dial(target).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_evicts_every_source_for_destination() {
        let dialer = Arc::new(MockDialer::default());
        let cache = cache(dialer.clone(), Arc::new(CountingHandler::default()));

        let a = cache.get_or_dial(key([10, 0, 0, 1], None)).await.unwrap();
        let b = cache
            .get_or_dial(key([10, 0, 0, 1], Some([10, 0, 0, 5])))
            .await
            .unwrap();
        let other = cache.get_or_dial(key([10, 0, 0, 10], None)).await.unwrap();

        cache.remove(IpAddr::from([10, 0, 0, 1])).await;

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(!other.is_closed());
        assert!(cache.get(key([10, 0, 0, 1], None)).await.is_none());
        assert!(cache.get(key([10, 0, 0, 10], None)).await.is_some());
    }

    #[tokio::test]
    async fn test_register_inbound_keeps_live_entries() {
        let dialer = Arc::new(MockDialer::default());
        let cache = cache(dialer.clone(), Arc::new(CountingHandler::default()));
        let existing = cache.get_or_dial(key([10, 0, 0, 2], None)).await.unwrap();

        let (stream, _peer) = tokio::io::duplex(1024);
        let (inbound, _reader) = TunnelConnection::new(
            stream,
            "10.0.0.2:51000".parse().unwrap(),
            "10.0.0.1:55554".parse().unwrap(),
        );
        cache.register_inbound(inbound.clone()).await;

        let unbound = cache.get(key([10, 0, 0, 2], None)).await.unwrap();
        let bound = cache
            .get(key([10, 0, 0, 2], Some([10, 0, 0, 1])))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&unbound, &existing));
        assert!(Arc::ptr_eq(&bound, &inbound));
    }

    #[tokio::test]
    async fn test_stop_all_closes_and_refuses() {
        let dialer = Arc::new(MockDialer::default());
        let cache = cache(dialer.clone(), Arc::new(CountingHandler::default()));
        let conn = cache.get_or_dial(key([10, 0, 0, 2], None)).await.unwrap();

        cache.stop_all().await;

        assert!(conn.is_closed());
        assert!(cache.is_empty().await);
        assert!(matches!(
            cache.get_or_dial(key([10, 0, 0, 2], None)).await,
            Err(TunnelError::Stopped)
        ));
    }
}
