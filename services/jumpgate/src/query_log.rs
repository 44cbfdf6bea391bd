//! Best-effort trace of relayed payloads.
//!
//! When enabled, sessions enqueue a text entry for every chunk they relay and
//! a background loop appends queued entries to disk every few seconds.
//! Enqueueing never blocks on a slow disk for long: a full queue is flushed
//! in place and the entry retried once, and dropped if it still does not fit.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum queued entries before a forced flush.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Period of the background flush loop.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Direction of a traced payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to remote.
    Query,
    /// Remote to client.
    Response,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Query => "Query",
            Direction::Response => "Response",
        }
    }
}

/// Render one trace entry.
pub fn format_entry(
    client_addr: SocketAddr,
    target: &str,
    direction: Direction,
    payload: &[u8],
) -> String {
    format!(
        "Client Address: {:?}\nServer Address: {:?}\n{}: {:?}\n\n",
        client_addr.to_string(),
        target,
        direction.label(),
        String::from_utf8_lossy(payload),
    )
}

/// Queue of trace entries waiting to be written to disk.
pub struct QueryLog {
    path: PathBuf,
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl QueryLog {
    /// Create a query log writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a query log with a custom queue capacity.
    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            path: path.into(),
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Path the entries are appended to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an entry for the next flush.
    pub async fn enqueue(&self, entry: String) {
        let entry = match self.tx.try_send(entry) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(entry)) => entry,
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        };

        if let Err(e) = self.flush().await {
            warn!(path = %self.path.display(), error = %e, "Forced query log flush failed");
        }

        if self.tx.try_send(entry).is_err() {
            debug!("Query log still full after flush, dropping entry");
        }
    }

    /// Append every queued entry to the log file.
    ///
    /// Returns the number of entries written.
    pub async fn flush(&self) -> io::Result<usize> {
        let mut buffer = String::new();
        let mut count = 0usize;
        {
            let mut rx = self.rx.lock().await;
            while let Ok(entry) = rx.try_recv() {
                buffer.push_str(&entry);
                buffer.push('\n');
                count += 1;
            }
        }

        if count == 0 {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        Ok(count)
    }
}

/// Flush the query log periodically, and once more on shutdown.
pub async fn run_flush_loop(log: Arc<QueryLog>, interval: Duration, shutdown: CancellationToken) {
    info!(path = %log.path().display(), "Starting query log flush loop");

    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                if let Err(e) = log.flush().await {
                    warn!(path = %log.path().display(), error = %e, "Query log flush failed");
                }
            }
            _ = shutdown.cancelled() => {
                if let Err(e) = log.flush().await {
                    warn!(path = %log.path().display(), error = %e, "Final query log flush failed");
                }
                info!("Query log flush loop shutting down");
                break;
            }
        }
    }
}
