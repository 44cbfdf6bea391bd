//! Client session handling.
//!
//! One session per accepted client socket:
//!
//! ```text
//! client ─► [socket reader] ─► input ─► ┐
//!                                       ├─ [acquire + relay] ◄─► remote
//! client ◄─ [writer loop]  ◄─ output ◄─ ┘
//! ```
//!
//! The remote is pre-dialed as soon as the session starts. The socket reader
//! and the acquire/relay task run as their own tasks; the writer loop runs in
//! the session task and also enforces the absolute lifetime. Everything hangs
//! off one cancellation token, a child of the listener's shutdown token.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use jumpgate_id::SessionId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::pool::{PoolError, PoolKey, RemotePool};
use super::relay::{Relay, RelayConfig, RelayError, RelayExit, RelaySummary};
use crate::query_log::{format_entry, Direction, QueryLog};
use crate::stats::{SessionRegistration, Stats};

/// Hard cap on a session's duration.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(300);

/// Capacity, in messages, of each session queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256 * 1024;

/// Size of each read from the client.
pub const DEFAULT_CLIENT_READ_SIZE: usize = 256 * 1024;

/// How long queued output may still be flushed after the session is cancelled.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_lifetime: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
    pub relay: RelayConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_lifetime: DEFAULT_MAX_LIFETIME,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            read_buffer_size: DEFAULT_CLIENT_READ_SIZE,
            relay: RelayConfig::default(),
        }
    }
}

/// Process-wide services every session uses.
#[derive(Clone)]
pub struct ProxyServices {
    pub pool: Arc<RemotePool>,
    pub stats: Arc<Stats>,
    pub query_log: Option<Arc<QueryLog>>,
}

impl ProxyServices {
    pub fn new(pool: Arc<RemotePool>, stats: Arc<Stats>) -> Self {
        Self {
            pool,
            stats,
            query_log: None,
        }
    }

    pub fn with_query_log(mut self, query_log: Arc<QueryLog>) -> Self {
        self.query_log = Some(query_log);
        self
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    PreDialing,
    Relaying,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, PreDialing)
                | (PreDialing, Relaying)
                | (Accepted | PreDialing | Relaying, Closing)
                | (Closing, Closed)
        )
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The remote closed its side.
    RemoteClosed,
    /// The client went away.
    ClientClosed,
    /// The absolute lifetime elapsed.
    LifetimeExceeded,
    /// The listener is shutting down.
    Shutdown,
}

/// Why a session ended with an error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to acquire remote connection: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("failed to write to client: {0}")]
    ClientWrite(#[source] io::Error),
}

impl SessionError {
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, SessionError::Relay(e) if e.is_idle_timeout())
    }
}

enum WriterExit {
    OutputClosed,
    Cancelled,
    LifetimeExceeded,
    ClientWrite(io::Error),
}

enum RelayOutcome {
    Relayed(Result<RelaySummary, RelayError>),
    AcquireFailed(PoolError),
    Cancelled,
}

/// Tracks and logs state changes.
#[derive(Clone)]
struct StateTracker {
    session_id: SessionId,
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateTracker {
    fn advance(&self, next: SessionState) {
        let session_id = self.session_id;
        self.tx.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                warn!(%session_id, from = ?current, to = ?next, "Ignoring invalid session transition");
                return false;
            }
            debug!(%session_id, from = ?current, to = ?next, "Session state changed");
            *current = next;
            true
        });
    }
}

/// Payload tracing for one session.
#[derive(Clone)]
struct QueryTrace {
    log: Arc<QueryLog>,
    client_addr: SocketAddr,
    target: String,
}

impl QueryTrace {
    async fn record(&self, direction: Direction, payload: &[u8]) {
        self.log
            .enqueue(format_entry(self.client_addr, &self.target, direction, payload))
            .await;
    }
}

/// One accepted client connection.
pub struct Session {
    id: SessionId,
    born: Instant,
    client: TcpStream,
    peer_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    config: SessionConfig,
    services: ProxyServices,
    state: StateTracker,
}

impl Session {
    /// Create a session for an accepted socket.
    pub fn new(
        client: TcpStream,
        peer_addr: SocketAddr,
        remote_host: impl Into<String>,
        remote_port: u16,
        config: SessionConfig,
        services: ProxyServices,
    ) -> Self {
        let id = SessionId::generate();
        let (tx, _) = watch::channel(SessionState::Accepted);
        Self {
            id,
            born: Instant::now(),
            client,
            peer_addr,
            remote_host: remote_host.into(),
            remote_port,
            config,
            services,
            state: StateTracker {
                session_id: id,
                tx: Arc::new(tx),
            },
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.tx.subscribe()
    }

    /// Relay the session until it ends, then tear everything down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<SessionEnd, SessionError> {
        let Session {
            id,
            born,
            client,
            peer_addr,
            remote_host,
            remote_port,
            config,
            services,
            state,
        } = self;

        let key = PoolKey::new(id, remote_host, remote_port);
        let target = key.target();
        let cancel = shutdown.child_token();
        let deadline = born + config.max_lifetime;

        info!(session_id = %id, peer_addr = %peer_addr, target = %target, "Session started");

        state.advance(SessionState::PreDialing);
        services.pool.pre_dial(key.clone(), cancel.child_token()).await;
        let registration = services.stats.register(id);

        let trace = services.query_log.as_ref().map(|log| QueryTrace {
            log: Arc::clone(log),
            client_addr: peer_addr,
            target: target.clone(),
        });

        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (output_tx, mut output_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (client_read, mut client_write) = client.into_split();

        let reader = tokio::spawn(
            read_client(
                client_read,
                input_tx,
                config.read_buffer_size,
                Arc::clone(&services.stats),
                trace.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        );

        let relay = tokio::spawn(
            acquire_and_relay(
                Arc::clone(&services.pool),
                key.clone(),
                Relay::new(id, config.relay.clone()),
                input_rx,
                output_tx,
                cancel.clone(),
                registration,
                state.clone(),
            )
            .in_current_span(),
        );

        let writer_exit = write_client(
            &mut output_rx,
            &mut client_write,
            deadline,
            &cancel,
            trace.as_ref(),
        )
        .await;

        state.advance(SessionState::Closing);
        cancel.cancel();

        let relay_outcome = relay.await.unwrap_or_else(|e| {
            RelayOutcome::Relayed(Err(RelayError::Worker(e.to_string())))
        });
        if let Err(e) = reader.await {
            debug!(session_id = %id, error = %e, "Client reader task failed");
        }

        if let Err(e) = client_write.shutdown().await {
            debug!(session_id = %id, error = %e, "Client write shutdown failed");
        }
        drop(client_write);
        drop(output_rx);
        services.pool.release(&key).await;
        state.advance(SessionState::Closed);

        let result = session_result(writer_exit, relay_outcome, &shutdown);
        log_session_end(id, &result, born.elapsed());
        result
    }
}

fn session_result(
    writer_exit: WriterExit,
    relay_outcome: RelayOutcome,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, SessionError> {
    match (writer_exit, relay_outcome) {
        (WriterExit::ClientWrite(e), _) => Err(SessionError::ClientWrite(e)),
        (WriterExit::LifetimeExceeded, _) => Ok(SessionEnd::LifetimeExceeded),
        (_, RelayOutcome::AcquireFailed(e)) => Err(SessionError::Pool(e)),
        (_, RelayOutcome::Relayed(Err(e))) => Err(SessionError::Relay(e)),
        (_, RelayOutcome::Relayed(Ok(summary))) if summary.exit == RelayExit::RemoteClosed => {
            Ok(SessionEnd::RemoteClosed)
        }
        _ if shutdown.is_cancelled() => Ok(SessionEnd::Shutdown),
        _ => Ok(SessionEnd::ClientClosed),
    }
}

fn log_session_end(id: SessionId, result: &Result<SessionEnd, SessionError>, duration: Duration) {
    let duration_ms = duration.as_millis() as u64;
    match result {
        Ok(SessionEnd::LifetimeExceeded) => {
            debug!(session_id = %id, duration_ms, "Session lifetime exceeded, context expired")
        }
        Ok(end) => info!(session_id = %id, end = ?end, duration_ms, "Session closed"),
        Err(e) if e.is_idle_timeout() => {
            warn!(session_id = %id, error = %e, duration_ms, "Session closed after idle timeout")
        }
        Err(SessionError::Pool(e)) => {
            error!(session_id = %id, error = %e, duration_ms, "Error in creating remote connection")
        }
        Err(e) => error!(session_id = %id, error = %e, duration_ms, "Session failed"),
    }
}

/// Socket reader: client bytes onto the input queue.
async fn read_client<R>(
    mut client: R,
    input: mpsc::Sender<Bytes>,
    buffer_size: usize,
    stats: Arc<Stats>,
    trace: Option<QueryTrace>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = client.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Client closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Client read ended");
                    break;
                }
            },
        };

        stats.increment_requests();
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if let Some(trace) = &trace {
            trace.record(Direction::Query, &chunk).await;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = input.send(chunk) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Shutting down client reader");
}

/// Acquire the pre-dialed remote and run the relay over it.
#[allow(clippy::too_many_arguments)]
async fn acquire_and_relay(
    pool: Arc<RemotePool>,
    key: PoolKey,
    relay: Relay,
    input: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    registration: SessionRegistration,
    state: StateTracker,
) -> RelayOutcome {
    let acquired = tokio::select! {
        biased;
        _ = cancel.cancelled() => return RelayOutcome::Cancelled,
        acquired = pool.acquire(&key) => acquired,
    };

    match acquired {
        Ok(remote) => {
            state.advance(SessionState::Relaying);
            let result = relay
                .run(remote, input, output, cancel, Some(registration))
                .await;
            RelayOutcome::Relayed(result)
        }
        Err(e) => {
            cancel.cancel();
            RelayOutcome::AcquireFailed(e)
        }
    }
}

/// Writer loop: output queue onto the client socket, bounded by the lifetime.
///
/// Once `cancel` fires, output already queued is still flushed to the client,
/// but only for `DEFAULT_DRAIN_TIMEOUT`: a client that stopped reading does
/// not hold the session open.
async fn write_client<W>(
    output: &mut mpsc::Receiver<Bytes>,
    client: &mut W,
    deadline: Instant,
    cancel: &CancellationToken,
    trace: Option<&QueryTrace>,
) -> WriterExit
where
    W: AsyncWrite + Unpin,
{
    let lifetime = tokio::time::sleep_until(deadline);
    tokio::pin!(lifetime);

    loop {
        let data = tokio::select! {
            biased;
            _ = &mut lifetime => return WriterExit::LifetimeExceeded,
            _ = cancel.cancelled() => break,
            data = output.recv() => match data {
                Some(data) => data,
                None => return WriterExit::OutputClosed,
            },
        };

        if let Some(trace) = trace {
            trace.record(Direction::Response, &data).await;
        }

        let write = client.write_all(&data);
        tokio::pin!(write);
        tokio::select! {
            biased;
            _ = &mut lifetime => return WriterExit::LifetimeExceeded,
            written = &mut write => {
                if let Err(e) = written {
                    return WriterExit::ClientWrite(e);
                }
            }
            _ = cancel.cancelled() => {
                // Finish the chunk in flight before draining the rest.
                match tokio::time::timeout_at(drain_deadline(deadline), &mut write).await {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => return WriterExit::ClientWrite(e),
                    Err(_) => {
                        debug!("Client not reading, dropping undelivered output");
                        return WriterExit::Cancelled;
                    }
                }
            }
        }
    }

    debug!("Shutting down client writer");
    drain_output(output, client, drain_deadline(deadline), trace).await
}

fn drain_deadline(lifetime: Instant) -> Instant {
    (Instant::now() + DEFAULT_DRAIN_TIMEOUT).min(lifetime)
}

/// Flush what is already queued without waiting for more.
async fn drain_output<W>(
    output: &mut mpsc::Receiver<Bytes>,
    client: &mut W,
    stop: Instant,
    trace: Option<&QueryTrace>,
) -> WriterExit
where
    W: AsyncWrite + Unpin,
{
    loop {
        let data = match output.try_recv() {
            Ok(data) => data,
            Err(mpsc::error::TryRecvError::Empty) => return WriterExit::Cancelled,
            Err(mpsc::error::TryRecvError::Disconnected) => return WriterExit::OutputClosed,
        };

        if let Some(trace) = trace {
            trace.record(Direction::Response, &data).await;
        }

        match tokio::time::timeout_at(stop, client.write_all(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return WriterExit::ClientWrite(e),
            Err(_) => {
                debug!("Client not reading, dropping undelivered output");
                return WriterExit::Cancelled;
            }
        }
    }
}
