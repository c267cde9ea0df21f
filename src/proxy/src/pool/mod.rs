//! Connection pool of idle server connections, plus the stash of
//! connections currently paused by a client session.
//!
//! Containers are monitor-protected; no lock is held across I/O. Every move
//! out of pool or stash cancels the entry's watchdog before the connection
//! is handed back (reset-before-reuse).

use crate::backend::ServerConnection;
use crate::protocol::mysql::packet::writers::write_quit;

use common::metrics::metric_def::{POOL_CLOSED_TOTAL, POOL_IDLE_CONN, POOL_STASHED_CONN};
use common::metrics::{counter_inc, gauge_dec, gauge_inc};
use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const DEFAULT_MAX_IDLE_SERVER_CONNECTIONS: u32 = 64;

/// What the pool knows about an entry without touching the connection.
#[derive(Debug, Clone)]
pub struct PooledMeta {
    pub endpoint: String,
    pub tls: bool,
    pub authenticated: bool,
    pub username: Option<Vec<u8>>,
}

type SharedConn = Arc<tokio::sync::Mutex<Option<ServerConnection>>>;

struct PooledEntry {
    entry_id: u64,
    meta: PooledMeta,
    conn: SharedConn,
    watchdog: JoinHandle<()>,
}

impl PooledEntry {
    /// Cancels the idle timer and the pending recv, then takes the
    /// connection back. `None` means the watchdog removed it first.
    async fn reset(self) -> Option<ServerConnection> {
        self.watchdog.abort();
        let _ = self.watchdog.await;
        self.conn.lock().await.take()
    }
}

/// A connection paused by a client; stealable by others after `after`.
struct Stashed {
    conn: ServerConnection,
    conn_id: String,
    after: Instant,
}

pub struct ConnectionPool {
    max_pooled_connections: u32,
    idle_timeout: Duration,

    pool: Mutex<HashMap<String, VecDeque<PooledEntry>>>,
    stash: Mutex<HashMap<String, VecDeque<Stashed>>>,

    entry_seq: AtomicU64,
    reused: AtomicU64,
}

impl ConnectionPool {
    pub fn new(max_pooled_connections: u32, idle_timeout: Duration) -> Self {
        Self {
            max_pooled_connections,
            idle_timeout,
            pool: Mutex::new(HashMap::new()),
            stash: Mutex::new(HashMap::new()),
            entry_seq: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn max_pooled_connections(&self) -> u32 {
        self.max_pooled_connections
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn current_pooled_connections(&self) -> u32 {
        self.pool.lock().values().map(|q| q.len() as u32).sum()
    }

    pub fn current_stashed_connections(&self) -> usize {
        self.stash.lock().values().map(|q| q.len()).sum()
    }

    pub fn reused_connections(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Adds an idle connection; a full pool quit-and-closes it instead.
    pub fn add(self: &Arc<Self>, conn: ServerConnection) {
        if let Some(conn) = self.add_if_not_full(conn) {
            debug!(
                "pool full ({}); closing {} to {}",
                self.max_pooled_connections, conn.id, conn.endpoint
            );
            async_close_connection(conn);
        }
    }

    /// Adds an idle connection, handing it back if the pool is full.
    pub fn add_if_not_full(self: &Arc<Self>, conn: ServerConnection) -> Option<ServerConnection> {
        let mut pool = self.pool.lock();
        let pooled: u32 = pool.values().map(|q| q.len() as u32).sum();
        if pooled >= self.max_pooled_connections {
            return Some(conn);
        }

        let endpoint = conn.endpoint.clone();
        let entry_id = self.entry_seq.fetch_add(1, Ordering::Relaxed);
        let meta = PooledMeta {
            endpoint: endpoint.clone(),
            tls: conn.is_tls(),
            authenticated: conn.authenticated,
            username: conn.state.username.clone(),
        };
        let shared: SharedConn = Arc::new(tokio::sync::Mutex::new(Some(conn)));
        let watchdog = tokio::spawn(idle_watchdog(
            Arc::clone(self),
            endpoint.clone(),
            entry_id,
            Arc::clone(&shared),
            self.idle_timeout,
        ));
        pool.entry(endpoint).or_default().push_back(PooledEntry {
            entry_id,
            meta,
            conn: shared,
            watchdog,
        });
        gauge_inc(POOL_IDLE_CONN, 1.0, None);
        None
    }

    /// Takes the first pooled connection for `endpoint` the predicate
    /// accepts. The reused counter only counts actual hand-outs.
    pub async fn pop_if<P>(&self, endpoint: &str, pred: P) -> Option<ServerConnection>
    where
        P: Fn(&PooledMeta) -> bool,
    {
        loop {
            let entry = {
                let mut pool = self.pool.lock();
                let queue = pool.get_mut(endpoint)?;
                let pos = queue.iter().position(|entry| pred(&entry.meta))?;
                let entry = queue.remove(pos).expect("position is in range");
                if queue.is_empty() {
                    pool.remove(endpoint);
                }
                entry
            };
            gauge_dec(POOL_IDLE_CONN, 1.0, None);
            match entry.reset().await {
                Some(conn) => {
                    self.reused.fetch_add(1, Ordering::Relaxed);
                    return Some(conn);
                }
                // the watchdog beat us to it; try the next match.
                None => continue,
            }
        }
    }

    /// Pauses a connection on behalf of `from`; another session may steal it
    /// once `delay` elapsed.
    pub fn stash(&self, conn: ServerConnection, from: &str, delay: Duration) {
        let endpoint = conn.endpoint.clone();
        let stashed = Stashed {
            conn,
            conn_id: from.to_string(),
            after: Instant::now() + delay,
        };
        self.stash
            .lock()
            .entry(endpoint)
            .or_default()
            .push_back(stashed);
        gauge_inc(POOL_STASHED_CONN, 1.0, None);
    }

    /// The owner takes its connection back, sharing delay notwithstanding.
    pub fn unstash_mine(&self, endpoint: &str, conn_id: &str) -> Option<ServerConnection> {
        let mut stash = self.stash.lock();
        let queue = stash.get_mut(endpoint)?;
        let pos = queue.iter().position(|s| s.conn_id == conn_id)?;
        let stashed = queue.remove(pos).expect("position is in range");
        if queue.is_empty() {
            stash.remove(endpoint);
        }
        gauge_dec(POOL_STASHED_CONN, 1.0, None);
        Some(stashed.conn)
    }

    /// Steals the first stashed connection past its sharing delay (or any,
    /// with `ignore_sharing_delay`) that the predicate accepts.
    pub fn unstash_if<P>(
        &self,
        endpoint: &str,
        pred: P,
        ignore_sharing_delay: bool,
    ) -> Option<ServerConnection>
    where
        P: Fn(&ServerConnection) -> bool,
    {
        let now = Instant::now();
        let mut stash = self.stash.lock();
        let queue = stash.get_mut(endpoint)?;
        let pos = queue
            .iter()
            .position(|s| (ignore_sharing_delay || now >= s.after) && pred(&s.conn))?;
        let stashed = queue.remove(pos).expect("position is in range");
        if queue.is_empty() {
            stash.remove(endpoint);
        }
        gauge_dec(POOL_STASHED_CONN, 1.0, None);
        self.reused.fetch_add(1, Ordering::Relaxed);
        Some(stashed.conn)
    }

    /// "I no longer own these, but they are reusable": the closing session's
    /// stashed connections move to the pool.
    pub fn discard_all_stashed(self: &Arc<Self>, from: &str) {
        let mut taken = Vec::new();
        {
            let mut stash = self.stash.lock();
            stash.retain(|_, queue| {
                let mut keep = VecDeque::new();
                while let Some(stashed) = queue.pop_front() {
                    if stashed.conn_id == from {
                        taken.push(stashed.conn);
                    } else {
                        keep.push_back(stashed);
                    }
                }
                *queue = keep;
                !queue.is_empty()
            });
        }
        for conn in &taken {
            trace!("discarding stashed {} back to pool", conn.id);
        }
        for _ in 0..taken.len() {
            gauge_dec(POOL_STASHED_CONN, 1.0, None);
        }
        for conn in taken {
            self.add(conn);
        }
    }

    /// Shutdown: closes every idle and stashed connection.
    pub async fn clear(self: &Arc<Self>) {
        let entries: Vec<PooledEntry> = {
            let mut pool = self.pool.lock();
            pool.drain().flat_map(|(_, queue)| queue).collect()
        };
        for entry in entries {
            gauge_dec(POOL_IDLE_CONN, 1.0, None);
            if let Some(conn) = entry.reset().await {
                async_close_connection(conn);
            }
        }
        let stashed: Vec<Stashed> = {
            let mut stash = self.stash.lock();
            stash.drain().flat_map(|(_, queue)| queue).collect()
        };
        for stashed in stashed {
            gauge_dec(POOL_STASHED_CONN, 1.0, None);
            async_close_connection(stashed.conn);
        }
    }

    fn remove_entry(&self, endpoint: &str, entry_id: u64) -> bool {
        let mut pool = self.pool.lock();
        let Some(queue) = pool.get_mut(endpoint) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|entry| entry.entry_id == entry_id) else {
            return false;
        };
        queue.remove(pos);
        if queue.is_empty() {
            pool.remove(endpoint);
        }
        gauge_dec(POOL_IDLE_CONN, 1.0, None);
        true
    }
}

/// Waits for the idle timeout or for the server to close/say something;
/// either way the entry leaves the pool and the socket is closed.
async fn idle_watchdog(
    pool: Arc<ConnectionPool>,
    endpoint: String,
    entry_id: u64,
    shared: SharedConn,
    idle_timeout: Duration,
) {
    let mut guard = shared.lock().await;
    let Some(conn) = guard.as_mut() else {
        return;
    };

    let mut probe = [0u8; 16];
    let reason = tokio::select! {
        _ = tokio::time::sleep(idle_timeout) => "idle timeout",
        read = conn.channel.reader().r.read(&mut probe) => match read {
            Ok(0) => "server closed the connection",
            Ok(_) => "unsolicited server bytes",
            Err(_) => "transport error",
        },
    };

    let conn = guard.take();
    drop(guard);

    pool.remove_entry(&endpoint, entry_id);
    if let Some(mut conn) = conn {
        debug!("removing pooled {} to {endpoint}: {reason}", conn.id);
        let _ = conn.channel.shutdown().await;
        counter_inc(POOL_CLOSED_TOTAL, 1, None);
    }
}

/// Graceful close: COM_QUIT, await whatever the server replies, close. Any
/// error along the way is ignored.
pub struct ConnectionCloser {
    conn: ServerConnection,
    before_close: Option<Box<dyn FnOnce(&ServerConnection) + Send>>,
}

impl ConnectionCloser {
    pub fn new(conn: ServerConnection) -> Self {
        Self {
            conn,
            before_close: None,
        }
    }

    pub fn before_close<F>(mut self, cb: F) -> Self
    where
        F: FnOnce(&ServerConnection) + Send + 'static,
    {
        self.before_close = Some(Box::new(cb));
        self
    }

    pub async fn close(mut self) {
        if let Some(cb) = self.before_close.take() {
            cb(&self.conn);
        }
        let _ = write_quit(self.conn.channel.writer()).await;
        let _ = self.conn.channel.recv_msg().await;
        let _ = self.conn.channel.shutdown().await;
        counter_inc(POOL_CLOSED_TOTAL, 1, None);
    }
}

pub fn async_close_connection(conn: ServerConnection) -> JoinHandle<()> {
    tokio::spawn(ConnectionCloser::new(conn).close())
}

/// Process-wide registry of pools, one per route.
#[derive(Default)]
pub struct ConnectionPoolComponent {
    pools: DashMap<String, Arc<ConnectionPool>>,
}

impl ConnectionPoolComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, pool: Arc<ConnectionPool>) {
        self.pools.insert(name.to_string(), pool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn clear(&self) {
        for entry in self.pools.iter() {
            entry.value().clear().await;
        }
        self.pools.clear();
    }
}
