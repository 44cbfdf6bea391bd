//! TCP jump-proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session ── pre-dial ──> RemotePool ──> Remote
//!                          │                        │
//!                          └── acquire ─────────────┘
//!                          └── Relay (pumps + idle watchdog)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, ProxyServices, RemotePool};
//!
//! let services = ProxyServices::new(Arc::new(RemotePool::new()), Arc::new(Stats::new()));
//! let config = ListenerConfig::new("0.0.0.0:2222", "10.0.0.5", 22);
//! let listener = Arc::new(Listener::bind(config, services).await?);
//! listener.run(shutdown).await?;
//! ```

mod listener;
mod pool;
mod relay;
mod session;

pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use pool::{PoolConfig, PoolError, PoolKey, PoolStats, RemotePool};
pub use relay::{Relay, RelayConfig, RelayError, RelayExit, RelaySummary};
pub use session::{
    ProxyServices, Session, SessionConfig, SessionEnd, SessionError, SessionState,
};
