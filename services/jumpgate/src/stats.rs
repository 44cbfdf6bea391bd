//! Process-wide connection counters.
//!
//! Every session touches these, so they live behind one mutex. The roster of
//! live session ids is unordered: removal swaps the last entry into the hole.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jumpgate_id::SessionId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default period of the stats report loop.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Counters {
    active_connections: i64,
    total_connections: u64,
    requests: u64,
    session_ids: Vec<SessionId>,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub active_connections: i64,
    pub total_connections: u64,
    pub requests: u64,
    pub session_ids: Vec<SessionId>,
}

/// Connection counters shared by all listeners.
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<Counters>,
}

impl Stats {
    /// Create an empty set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_active_connections(&self) {
        self.counters().active_connections += 1;
    }

    pub fn decrement_active_connections(&self) {
        self.counters().active_connections -= 1;
    }

    pub fn increment_total_connections(&self) {
        self.counters().total_connections += 1;
    }

    pub fn increment_requests(&self) {
        self.counters().requests += 1;
    }

    pub fn add_session_id(&self, id: SessionId) {
        self.counters().session_ids.push(id);
    }

    /// Remove a session id from the roster. Unknown ids are ignored.
    pub fn remove_session_id(&self, id: &SessionId) {
        let mut counters = self.counters();
        match counters.session_ids.iter().position(|live| live == id) {
            Some(idx) => {
                counters.session_ids.swap_remove(idx);
            }
            None => {
                drop(counters);
                warn!(session_id = %id, "Session id missing from roster");
            }
        }
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters();
        StatsSnapshot {
            active_connections: counters.active_connections,
            total_connections: counters.total_connections,
            requests: counters.requests,
            session_ids: counters.session_ids.clone(),
        }
    }

    /// Count a new session and put it on the roster.
    ///
    /// The returned guard undoes the active count and roster entry when
    /// dropped, so the session is unregistered exactly once no matter which
    /// component finishes last.
    pub fn register(self: &Arc<Self>, id: SessionId) -> SessionRegistration {
        {
            let mut counters = self.counters();
            counters.active_connections += 1;
            counters.total_connections += 1;
            counters.session_ids.push(id);
        }
        SessionRegistration {
            stats: Arc::clone(self),
            id,
        }
    }
}

/// Live registration of one session in [`Stats`].
#[derive(Debug)]
pub struct SessionRegistration {
    stats: Arc<Stats>,
    id: SessionId,
}

impl SessionRegistration {
    pub fn session_id(&self) -> SessionId {
        self.id
    }
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.stats.decrement_active_connections();
        self.stats.remove_session_id(&self.id);
    }
}

/// Log the counters periodically until shutdown.
pub async fn run_report_loop(stats: Arc<Stats>, interval: Duration, shutdown: CancellationToken) {
    info!(interval_secs = interval.as_secs(), "Starting stats report loop");

    let mut interval_timer = tokio::time::interval(interval);
    // The first tick completes immediately.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let snapshot = stats.snapshot();
                let session_ids: Vec<String> =
                    snapshot.session_ids.iter().map(ToString::to_string).collect();
                debug!(
                    active_connections = snapshot.active_connections,
                    total_connections = snapshot.total_connections,
                    requests = snapshot.requests,
                    session_ids = ?session_ids,
                    "Global stats"
                );
            }
            _ = shutdown.cancelled() => {
                info!("Stats report loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seq: u64) -> SessionId {
        SessionId::from_seed(1, seq)
    }

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.increment_active_connections();
        stats.increment_active_connections();
        stats.decrement_active_connections();
        stats.increment_total_connections();
        stats.increment_requests();
        stats.increment_requests();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.requests, 2);
    }

    #[test]
    fn test_remove_swaps_last_into_place() {
        let stats = Stats::new();
        for seq in 0..4 {
            stats.add_session_id(id(seq));
        }

        stats.remove_session_id(&id(1));

        let roster = stats.snapshot().session_ids;
        assert_eq!(roster, vec![id(0), id(3), id(2)]);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let stats = Stats::new();
        stats.add_session_id(id(0));
        stats.remove_session_id(&id(9));
        assert_eq!(stats.snapshot().session_ids, vec![id(0)]);
    }

    #[test]
    fn test_registration_guard() {
        let stats = Arc::new(Stats::new());

        let first = stats.register(id(0));
        let second = stats.register(id(1));
        assert_eq!(stats.snapshot().active_connections, 2);

        drop(first);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.session_ids, vec![second.session_id()]);

        drop(second);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert!(snapshot.session_ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_loop_stops_on_shutdown() {
        let stats = Arc::new(Stats::new());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_report_loop(
            Arc::clone(&stats),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(125)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
