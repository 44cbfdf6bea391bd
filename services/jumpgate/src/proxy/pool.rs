//! Pre-dialed remote connections.
//!
//! A session starts dialing its remote endpoint the moment the client is
//! accepted, so the dial overlaps with session setup. Connections are queued
//! under a key that includes the session id, which makes every queue a
//! private hand-off between one dial task and the session that started it.
//!
//! - A failed dial is retried after a fixed backoff until it succeeds or the
//!   session's cancellation token fires
//! - Dialed sockets get TCP keep-alive before being queued
//! - `acquire` waits a bounded time for the queued connection
//! - The queue delivers each connection to at most one caller

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jumpgate_id::SessionId;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Wait between failed dial attempts.
pub const DEFAULT_DIAL_BACKOFF: Duration = Duration::from_secs(2);

/// How long `acquire` waits for a queued connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single dial attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keep-alive probe period for pooled sockets.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Capacity of each per-key queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Pool timings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub dial_backoff: Duration,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dial_backoff: DEFAULT_DIAL_BACKOFF,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Key of one pre-dial queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub session_id: SessionId,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn new(session_id: SessionId, host: impl Into<String>, port: u16) -> Self {
        Self {
            session_id,
            host: host.into(),
            port,
        }
    }

    /// The remote endpoint as `host:port`.
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.target())
    }
}

/// Errors returned by [`RemotePool::acquire`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Nothing was ever pre-dialed under this key.
    #[error("no pre-dial registered for {key}")]
    NotFound { key: String },

    /// The pre-dial did not produce a connection in time.
    #[error("no connection for {key} became available within {waited:?}")]
    Unavailable { key: String, waited: Duration },
}

/// Counters for a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub dial_attempts: u64,
    pub connections_dialed: u64,
    pub connections_acquired: u64,
}

struct Slot {
    tx: mpsc::Sender<TcpStream>,
    rx: Arc<Mutex<mpsc::Receiver<TcpStream>>>,
}

/// Pool of pre-dialed remote connections, keyed per session.
pub struct RemotePool {
    config: PoolConfig,
    slots: RwLock<HashMap<PoolKey, Slot>>,
    dial_attempts: Arc<AtomicU64>,
    connections_dialed: Arc<AtomicU64>,
    connections_acquired: AtomicU64,
}

impl RemotePool {
    /// Create a pool with default timings.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a pool with custom timings.
    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
            dial_attempts: Arc::new(AtomicU64::new(0)),
            connections_dialed: Arc::new(AtomicU64::new(0)),
            connections_acquired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start dialing `key`'s endpoint in the background.
    ///
    /// The key's queue is registered before this returns, so a following
    /// `acquire` waits for the dial instead of failing with `NotFound`. The
    /// dial task runs until one connection is queued or `cancel` fires.
    pub async fn pre_dial(&self, key: PoolKey, cancel: CancellationToken) {
        let tx = self.register(&key).await;

        let task = DialTask {
            span_key: key.to_string(),
            target: key.target(),
            tx,
            config: self.config.clone(),
            dial_attempts: Arc::clone(&self.dial_attempts),
            connections_dialed: Arc::clone(&self.connections_dialed),
        };

        let span = tracing::debug_span!(
            "pre_dial",
            session_id = %key.session_id,
            host = %key.host,
            port = key.port
        );
        tokio::spawn(task.run(cancel).instrument(span));
    }

    /// Get or create the queue for a key, returning its sender.
    async fn register(&self, key: &PoolKey) -> mpsc::Sender<TcpStream> {
        // Fast path: read lock
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(key) {
                return slot.tx.clone();
            }
        }

        // Slow path: write lock
        let mut slots = self.slots.write().await;
        slots
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
                Slot {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .tx
            .clone()
    }

    /// Take the connection pre-dialed under `key`.
    ///
    /// Fails immediately with `NotFound` when nothing was pre-dialed for the
    /// key, and with `Unavailable` once the acquire deadline passes.
    pub async fn acquire(&self, key: &PoolKey) -> Result<TcpStream, PoolError> {
        let rx = {
            let slots = self.slots.read().await;
            slots.get(key).map(|slot| Arc::clone(&slot.rx))
        };

        let Some(rx) = rx else {
            warn!(key = %key, "Acquire for unknown pool key");
            return Err(PoolError::NotFound {
                key: key.to_string(),
            });
        };

        let waited = self.config.acquire_timeout;
        let received = timeout(waited, async { rx.lock().await.recv().await }).await;

        match received {
            Ok(Some(stream)) => {
                self.connections_acquired.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Got connection from pool");
                Ok(stream)
            }
            Ok(None) | Err(_) => Err(PoolError::Unavailable {
                key: key.to_string(),
                waited,
            }),
        }
    }

    /// Drop the queue for `key`, closing any connection nobody claimed.
    pub async fn release(&self, key: &PoolKey) {
        let removed = self.slots.write().await.remove(key);
        if removed.is_some() {
            debug!(key = %key, "Released pool key");
        }
    }

    /// Whether a queue is registered for `key`.
    pub async fn contains(&self, key: &PoolKey) -> bool {
        self.slots.read().await.contains_key(key)
    }

    /// Number of registered queues.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dial_attempts: self.dial_attempts.load(Ordering::Relaxed),
            connections_dialed: self.connections_dialed.load(Ordering::Relaxed),
            connections_acquired: self.connections_acquired.load(Ordering::Relaxed),
        }
    }
}

impl Default for RemotePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One background dial loop.
struct DialTask {
    span_key: String,
    target: String,
    tx: mpsc::Sender<TcpStream>,
    config: PoolConfig,
    dial_attempts: Arc<AtomicU64>,
    connections_dialed: Arc<AtomicU64>,
}

impl DialTask {
    async fn run(self, cancel: CancellationToken) {
        loop {
            self.dial_attempts.fetch_add(1, Ordering::Relaxed);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key = %self.span_key, "Pre-dial cancelled");
                    return;
                }
                result = connect(&self.target, &self.config) => result,
            };

            match attempt {
                Ok(stream) => {
                    self.connections_dialed.fetch_add(1, Ordering::Relaxed);
                    info!(remote = %self.target, "Created new connection to remote host");

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(key = %self.span_key, "Pre-dial cancelled before hand-off");
                        }
                        sent = self.tx.send(stream) => {
                            if sent.is_err() {
                                debug!(key = %self.span_key, "Pool key released before hand-off");
                            }
                        }
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        remote = %self.target,
                        error = %e,
                        retry_in_ms = self.config.dial_backoff.as_millis() as u64,
                        "Failed to connect to remote host"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(key = %self.span_key, "Pre-dial cancelled during backoff");
                            return;
                        }
                        _ = tokio::time::sleep(self.config.dial_backoff) => {}
                    }
                }
            }
        }
    }
}

/// Dial `target` once and enable keep-alive.
async fn connect(target: &str, config: &PoolConfig) -> io::Result<TcpStream> {
    let stream = match timeout(config.connect_timeout, TcpStream::connect(target)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
        }
    };

    set_keepalive(&stream, config.keepalive)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    let keepalive = keepalive.with_interval(period);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
