//! TCP listener for one route.
//!
//! Accepts client connections on the route's listen address and runs a
//! [`Session`] per connection against the route's remote.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::session::{ProxyServices, Session, SessionConfig};

/// Default maximum concurrent sessions per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to, `host:port`.
    pub bind_addr: String,
    /// Host every session on this listener dials.
    pub remote_host: String,
    /// Port every session on this listener dials.
    pub remote_port: u16,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    pub session: SessionConfig,
}

impl ListenerConfig {
    pub fn new(
        bind_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session: SessionConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
}

/// A bound route listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    services: ProxyServices,
    conn_semaphore: Arc<Semaphore>,
    sessions: TaskTracker,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listen address.
    pub async fn bind(config: ListenerConfig, services: ProxyServices) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            remote_host = %config.remote_host,
            remote_port = config.remote_port,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            services,
            sessions: TaskTracker::new(),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until `shutdown` fires, then wait for the running
    /// sessions to finish.
    ///
    /// Sessions run under child tokens of `shutdown`, so cancelling it also
    /// ends them.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let session = Session::new(
                        stream,
                        peer_addr,
                        self.config.remote_host.clone(),
                        self.config.remote_port,
                        self.config.session.clone(),
                        self.services.clone(),
                    );
                    let span = tracing::info_span!(
                        "session",
                        session_id = %session.id(),
                        peer = %peer_addr
                    );
                    let stats = Arc::clone(&self.stats);
                    let shutdown = shutdown.clone();

                    self.sessions.spawn(
                        async move {
                            if let Err(e) = session.run(shutdown).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Session ended with error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        self.sessions.close();
        info!(
            bind_addr = %local_addr,
            active = self.sessions.len(),
            "Listener stopped accepting, waiting for sessions"
        );
        self.sessions.wait().await;
        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RemotePool;
    use crate::stats::Stats;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn services() -> ProxyServices {
        ProxyServices::new(Arc::new(RemotePool::new()), Arc::new(Stats::new()))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ListenerConfig::new("127.0.0.1:0", "127.0.0.1", 9);
        let listener = Listener::bind(config, services()).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let config = ListenerConfig::new(addr.to_string(), "127.0.0.1", 9);
        assert!(Listener::bind(config, services()).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_over_max_connections() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = remote.accept().await {
                held.push(stream);
            }
        });

        let mut config = ListenerConfig::new("127.0.0.1:0", "127.0.0.1", remote_addr.port());
        config.max_connections = 1;
        let listener = Arc::new(Listener::bind(config, services()).await.unwrap());
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&listener).run(shutdown.clone()));

        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(listener.stats().connections_rejected.load(Ordering::Relaxed), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_running_sessions() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = remote.accept().await {
                held.push(stream);
            }
        });

        let config = ListenerConfig::new("127.0.0.1:0", "127.0.0.1", remote_addr.port());
        let listener = Arc::new(Listener::bind(config, services()).await.unwrap());
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&listener).run(shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.stats().connections_active.load(Ordering::Relaxed), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 16];
        let read = client.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(listener.stats().connections_closed.load(Ordering::Relaxed), 1);
    }
}
