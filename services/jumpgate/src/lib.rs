//! jumpgate
//!
//! TCP jump-proxy. Every configured route is a listener; every accepted
//! client gets its own freshly dialed connection to the route's remote, and
//! bytes are relayed both ways until either side closes, the session sits
//! idle too long, or its absolute lifetime runs out.

pub mod config;
pub mod proxy;
pub mod query_log;
pub mod stats;

pub use config::{Config, ConfigError, Route};
pub use proxy::{
    Listener, ListenerConfig, PoolConfig, PoolError, ProxyServices, RelayConfig, RemotePool,
    Session, SessionConfig, SessionEnd, SessionError, SessionState,
};
pub use query_log::QueryLog;
pub use stats::Stats;
