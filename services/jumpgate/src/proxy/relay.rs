//! Bidirectional relay between a session's queues and its remote connection.
//!
//! ## Workers
//!
//! ```text
//!  input queue ──► [client→remote pump] ──► remote
//!  output queue ◄── [remote→client pump] ◄── remote
//!                   [idle watchdog]  (1s tick, 30s idle limit)
//! ```
//!
//! All workers share the session's cancellation token. Whichever worker
//! finishes first (or the token itself) decides the exit cause; teardown then
//! cancels the token and joins every worker before the remote connection and
//! the session's stats registration are dropped. A worker added here is
//! covered by the same token and join, there is no per-worker signal to keep
//! in step.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use jumpgate_id::SessionId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::stats::SessionRegistration;

/// Maximum time without traffic in either direction.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the watchdog checks for idleness.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Size of each read from the remote.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256 * 1024;

/// Relay limits.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub idle_timeout: Duration,
    pub watchdog_interval: Duration,
    pub read_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Ways a relay can fail.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No bytes moved in either direction for too long.
    #[error("no traffic for {idle:?}")]
    IdleTimeout { idle: Duration },

    /// Writing client data to the remote failed.
    #[error("failed to write to remote: {0}")]
    RemoteWrite(#[source] io::Error),

    /// Reading from the remote failed.
    #[error("failed to read from remote: {0}")]
    RemoteRead(#[source] io::Error),

    /// A worker task panicked or was aborted.
    #[error("relay worker failed: {0}")]
    Worker(String),
}

impl RelayError {
    /// Returns true for the idle watchdog's timeout.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, RelayError::IdleTimeout { .. })
    }
}

/// Non-error reasons a relay stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The remote sent EOF.
    RemoteClosed,
    /// The session stopped taking output.
    ClientClosed,
    /// The cancellation token fired.
    Cancelled,
}

/// Outcome of a relay that ended without error.
#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub exit: RelayExit,
    pub bytes_to_remote: u64,
    pub bytes_from_remote: u64,
    pub duration: Duration,
    pub workers: usize,
}

/// Last time a byte moved, shared by the pumps and the watchdog.
#[derive(Debug, Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

type WorkerResult = Result<RelayExit, RelayError>;

/// Relay for one session.
#[derive(Debug, Clone)]
pub struct Relay {
    session_id: SessionId,
    config: RelayConfig,
}

impl Relay {
    pub fn new(session_id: SessionId, config: RelayConfig) -> Self {
        Self { session_id, config }
    }

    /// Pump bytes until the first termination cause, then tear down.
    ///
    /// `cancel` is the session's own token: it is cancelled on return, which
    /// also stops the session's socket workers. `registration` is dropped
    /// after every worker has exited.
    pub async fn run<S>(
        &self,
        remote: S,
        input: mpsc::Receiver<Bytes>,
        output: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
        registration: Option<SessionRegistration>,
    ) -> Result<RelaySummary, RelayError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let started = Instant::now();
        let activity = Activity::new();
        let bytes_to_remote = Arc::new(AtomicU64::new(0));
        let bytes_from_remote = Arc::new(AtomicU64::new(0));
        let (remote_read, remote_write) = tokio::io::split(remote);

        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        workers.spawn(
            pump_to_remote(
                input,
                remote_write,
                activity.clone(),
                Arc::clone(&bytes_to_remote),
                cancel.clone(),
            )
            .in_current_span(),
        );
        workers.spawn(
            pump_to_client(
                remote_read,
                output,
                activity.clone(),
                Arc::clone(&bytes_from_remote),
                self.config.read_buffer_size,
                cancel.clone(),
            )
            .in_current_span(),
        );
        workers.spawn(
            watch_idle(
                activity,
                self.config.idle_timeout,
                self.config.watchdog_interval,
                cancel.clone(),
            )
            .in_current_span(),
        );

        let registered = workers.len();
        debug!(session_id = %self.session_id, workers = registered, "Relay started");

        let outcome = tokio::select! {
            Some(joined) = workers.join_next() => flatten(joined),
            _ = cancel.cancelled() => Ok(RelayExit::Cancelled),
        };

        cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = flatten(joined) {
                debug!(session_id = %self.session_id, error = %e, "Relay worker failed during teardown");
            }
        }
        // Both halves of the remote were owned by the joined workers, so the
        // remote connection is closed at this point.
        drop(registration);

        let duration = started.elapsed();
        let bytes_to_remote = bytes_to_remote.load(Ordering::Relaxed);
        let bytes_from_remote = bytes_from_remote.load(Ordering::Relaxed);
        debug!(
            session_id = %self.session_id,
            bytes_to_remote,
            bytes_from_remote,
            duration_ms = duration.as_millis() as u64,
            "Relay stopped, remote connection closed"
        );

        outcome.map(|exit| RelaySummary {
            exit,
            bytes_to_remote,
            bytes_from_remote,
            duration,
            workers: registered,
        })
    }
}

fn flatten(joined: Result<WorkerResult, JoinError>) -> WorkerResult {
    joined.unwrap_or_else(|e| Err(RelayError::Worker(e.to_string())))
}

/// Client→remote pump.
async fn pump_to_remote<W>(
    mut input: mpsc::Receiver<Bytes>,
    mut remote: W,
    activity: Activity,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> WorkerResult
where
    W: AsyncWrite + Unpin,
{
    loop {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayExit::Cancelled),
            data = input.recv() => data,
        };

        let Some(data) = data else {
            break;
        };

        activity.touch();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayExit::Cancelled),
            written = remote.write_all(&data) => written.map_err(RelayError::RemoteWrite)?,
        }
        sent.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    // Client is done sending. Half-close and leave the other direction running.
    debug!("Client input closed, shutting down remote write side");
    tokio::select! {
        _ = cancel.cancelled() => return Ok(RelayExit::Cancelled),
        shutdown = remote.shutdown() => {
            if let Err(e) = shutdown {
                debug!(error = %e, "Remote write shutdown failed");
            }
        }
    }
    cancel.cancelled().await;
    Ok(RelayExit::Cancelled)
}

/// Remote→client pump.
async fn pump_to_client<R>(
    mut remote: R,
    output: mpsc::Sender<Bytes>,
    activity: Activity,
    received: Arc<AtomicU64>,
    buffer_size: usize,
    cancel: CancellationToken,
) -> WorkerResult
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayExit::Cancelled),
            read = remote.read(&mut buf) => read.map_err(RelayError::RemoteRead)?,
        };

        if n == 0 {
            return Ok(RelayExit::RemoteClosed);
        }

        activity.touch();
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayExit::Cancelled),
            pushed = output.send(chunk) => {
                if pushed.is_err() {
                    return Ok(RelayExit::ClientClosed);
                }
            }
        }
        received.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Idle watchdog.
async fn watch_idle(
    activity: Activity,
    idle_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> WorkerResult {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(RelayExit::Cancelled),
            _ = ticker.tick() => {
                let idle = activity.idle_for();
                if idle >= idle_timeout {
                    return Err(RelayError::IdleTimeout { idle });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use tokio::io::DuplexStream;

    struct Harness {
        remote: DuplexStream,
        input: mpsc::Sender<Bytes>,
        output: mpsc::Receiver<Bytes>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<RelaySummary, RelayError>>,
    }

    fn spawn_relay(config: RelayConfig, registration: Option<SessionRegistration>) -> Harness {
        let (remote, relay_side) = tokio::io::duplex(64 * 1024);
        let (input_tx, input_rx) = mpsc::channel(16);
        let (output_tx, output_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let relay = Relay::new(SessionId::from_seed(3, 3), config);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            relay
                .run(relay_side, input_rx, output_tx, token, registration)
                .await
        });

        Harness {
            remote,
            input: input_tx,
            output: output_rx,
            cancel,
            handle,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relays_both_directions() {
        let mut h = spawn_relay(RelayConfig::default(), None);

        h.input.send(Bytes::from_static(b"PING")).await.unwrap();
        h.input.send(Bytes::from_static(b" more")).await.unwrap();
        let mut buf = [0u8; 9];
        h.remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING more");

        h.remote.write_all(b"PONG").await.unwrap();
        assert_eq!(h.output.recv().await.unwrap(), Bytes::from_static(b"PONG"));

        drop(h.remote);
        let summary = h.handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, RelayExit::RemoteClosed);
        assert_eq!(summary.bytes_to_remote, 9);
        assert_eq!(summary.bytes_from_remote, 4);
        assert_eq!(summary.workers, 3);
        assert!(h.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires() {
        let h = spawn_relay(RelayConfig::default(), None);
        let started = Instant::now();

        let err = h.handle.await.unwrap().unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_idle_timeout());
        assert!(elapsed >= DEFAULT_IDLE_TIMEOUT);
        assert!(elapsed <= DEFAULT_IDLE_TIMEOUT + DEFAULT_WATCHDOG_INTERVAL);
        assert!(h.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_traffic_is_not_idle() {
        let h = spawn_relay(RelayConfig::default(), None);
        let Harness {
            mut remote,
            input,
            output: _output,
            cancel,
            handle,
        } = h;

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while matches!(remote.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        for _ in 0..299 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            input.send(Bytes::from_static(b".")).await.unwrap();
            assert!(!handle.is_finished());
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, RelayExit::Cancelled);
        assert_eq!(summary.bytes_to_remote, 299);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_traffic_alone_keeps_relay_alive() {
        let mut h = spawn_relay(RelayConfig::default(), None);

        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.remote.write_all(b"tick").await.unwrap();
            assert_eq!(h.output.recv().await.unwrap(), Bytes::from_static(b"tick"));
        }
        assert!(!h.handle.is_finished());

        h.cancel.cancel();
        let summary = h.handle.await.unwrap().unwrap();
        assert_eq!(summary.bytes_from_remote, 240);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_joins_every_worker() {
        let mut h = spawn_relay(RelayConfig::default(), None);

        h.cancel.cancel();
        let summary = h.handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, RelayExit::Cancelled);

        // Input receiver and output sender lived in workers; both are gone.
        assert!(h.input.is_closed());
        assert!(h.output.recv().await.is_none());

        // Remote sees EOF once both halves are dropped.
        let mut buf = [0u8; 8];
        assert_eq!(h.remote.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_input_closed_half_closes_remote() {
        let mut h = spawn_relay(RelayConfig::default(), None);

        h.input.send(Bytes::from_static(b"last words")).await.unwrap();
        drop(h.input);

        let mut received = Vec::new();
        h.remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        // The other direction still works after the half-close.
        h.remote.write_all(b"reply").await.unwrap();
        assert_eq!(h.output.recv().await.unwrap(), Bytes::from_static(b"reply"));
        assert!(!h.handle.is_finished());

        drop(h.remote);
        let summary = h.handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, RelayExit::RemoteClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_closed_ends_relay() {
        let mut h = spawn_relay(RelayConfig::default(), None);

        drop(h.output);
        h.remote.write_all(b"nobody listening").await.unwrap();

        let summary = h.handle.await.unwrap().unwrap();
        assert_eq!(summary.exit, RelayExit::ClientClosed);
        assert_eq!(summary.bytes_from_remote, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_released_on_teardown() {
        let stats = Arc::new(Stats::new());
        let registration = stats.register(SessionId::from_seed(3, 3));
        assert_eq!(stats.snapshot().active_connections, 1);

        let h = spawn_relay(RelayConfig::default(), Some(registration));
        let _ = h.handle.await.unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert!(snapshot.session_ids.is_empty());
        assert_eq!(snapshot.total_connections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_idle_timeout() {
        let h = spawn_relay(
            RelayConfig {
                idle_timeout: Duration::from_secs(3),
                ..RelayConfig::default()
            },
            None,
        );
        let started = Instant::now();

        let err = h.handle.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::IdleTimeout { idle } if idle >= Duration::from_secs(3)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
