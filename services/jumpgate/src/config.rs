//! jumpgate configuration.
//!
//! Process settings come from the environment. Routes come from a route file
//! (or the `JUMPGATE_ROUTES` variable), one route per line:
//!
//! ```text
//! # listen            remote
//! 0.0.0.0:2222        10.0.0.5:22
//! 127.0.0.1:9000      db.internal:5432
//! [::1]:8443          [fd00::7]:443
//! ```
//!
//! The legacy four-field form `listen_host listen_port remote_host remote_port`
//! is accepted too. Routes sharing a listen address are deduplicated, the last
//! one winning.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::proxy::{PoolConfig, RelayConfig, SessionConfig, DEFAULT_MAX_CONNECTIONS};
use crate::query_log::DEFAULT_FLUSH_INTERVAL;
use crate::stats::DEFAULT_REPORT_INTERVAL;

/// Default route file location.
pub const DEFAULT_ROUTES_FILE: &str = "/etc/jumpgate.conf";

/// Default query log location.
pub const DEFAULT_QUERY_LOG: &str = "logs/queries.log";

/// Errors found while parsing routes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A line did not have a listen and a remote address.
    #[error("line {line}: expected 'listen_host:listen_port remote_host:remote_port', got '{content}'")]
    MalformedRoute { line: usize, content: String },

    /// An address had no port.
    #[error("line {line}: missing port in '{address}'")]
    MissingPort { line: usize, address: String },

    /// A port was not a number in 1..=65535.
    #[error("line {line}: invalid port '{value}'")]
    InvalidPort { line: usize, value: String },

    /// An address had an empty host.
    #[error("line {line}: missing host in '{address}'")]
    MissingHost { line: usize, address: String },

    /// No routes were configured at all.
    #[error("no routes configured")]
    NoRoutes,
}

/// One listen address relayed to one remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub listen_host: String,
    pub listen_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl Route {
    /// `host:port` of the listen side.
    pub fn listen_addr(&self) -> String {
        join_host_port(&self.listen_host, self.listen_port)
    }

    /// `host:port` of the remote side.
    pub fn remote_addr(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn parse_port(line: usize, value: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            line,
            value: value.to_string(),
        }),
    }
}

fn parse_host(line: usize, host: &str, address: &str) -> Result<String, ConfigError> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ConfigError::MissingHost {
            line,
            address: address.to_string(),
        });
    }
    Ok(host.to_string())
}

fn parse_address(line: usize, address: &str) -> Result<(String, u16), ConfigError> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(ConfigError::MissingPort {
            line,
            address: address.to_string(),
        });
    };
    let host = parse_host(line, host, address)?;
    let port = parse_port(line, port)?;
    Ok((host, port))
}

/// Parse a single route line. Returns `None` for blank and comment lines.
pub fn parse_route_line(line: usize, content: &str) -> Result<Option<Route>, ConfigError> {
    let content = content.split('#').next().unwrap_or_default().trim();
    if content.is_empty() {
        return Ok(None);
    }

    let fields: Vec<&str> = content.split_whitespace().collect();
    let route = match fields.as_slice() {
        [listen, remote] => {
            let (listen_host, listen_port) = parse_address(line, listen)?;
            let (remote_host, remote_port) = parse_address(line, remote)?;
            Route {
                listen_host,
                listen_port,
                remote_host,
                remote_port,
            }
        }
        [listen_host, listen_port, remote_host, remote_port] => Route {
            listen_host: parse_host(line, listen_host, content)?,
            listen_port: parse_port(line, listen_port)?,
            remote_host: parse_host(line, remote_host, content)?,
            remote_port: parse_port(line, remote_port)?,
        },
        _ => {
            return Err(ConfigError::MalformedRoute {
                line,
                content: content.to_string(),
            })
        }
    };

    Ok(Some(route))
}

/// Parse a whole route table, deduplicating by listen address.
pub fn parse_routes(input: &str) -> Result<Vec<Route>, ConfigError> {
    let mut routes: Vec<Route> = Vec::new();

    for (idx, content) in input.lines().enumerate() {
        let Some(route) = parse_route_line(idx + 1, content)? else {
            continue;
        };

        match routes
            .iter_mut()
            .find(|existing| existing.listen_addr() == route.listen_addr())
        {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
    }

    if routes.is_empty() {
        return Err(ConfigError::NoRoutes);
    }
    Ok(routes)
}

/// jumpgate configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Deduplicated routes, one listener each.
    pub routes: Vec<Route>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Maximum concurrent sessions per listener.
    pub max_connections: usize,

    /// Pre-dial pool timings.
    pub pool: PoolConfig,

    /// Per-session limits, including the relay's.
    pub session: SessionConfig,

    /// Query trace file, when tracing is enabled.
    pub query_log: Option<PathBuf>,

    /// Query trace flush period.
    pub query_log_flush_interval: Duration,

    /// Stats report period.
    pub stats_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let routes = match lookup("JUMPGATE_ROUTES") {
            Some(inline) => parse_routes(&inline.replace(';', "\n"))
                .context("JUMPGATE_ROUTES contains an invalid route table.")?,
            None => {
                let path = lookup("JUMPGATE_ROUTES_FILE")
                    .unwrap_or_else(|| DEFAULT_ROUTES_FILE.to_string());
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read route file {path}."))?;
                parse_routes(&contents)
                    .with_context(|| format!("Route file {path} is invalid."))?
            }
        };

        let log_level = lookup("JUMPGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let max_connections: usize = lookup("JUMPGATE_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("JUMPGATE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let mut pool = PoolConfig::default();
        if let Some(ms) = lookup("JUMPGATE_ACQUIRE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("JUMPGATE_ACQUIRE_TIMEOUT_MS must be an integer (milliseconds).")?
        {
            pool.acquire_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = lookup("JUMPGATE_DIAL_BACKOFF_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("JUMPGATE_DIAL_BACKOFF_MS must be an integer (milliseconds).")?
        {
            pool.dial_backoff = Duration::from_millis(ms.max(10));
        }

        let mut relay = RelayConfig::default();
        if let Some(secs) = lookup("JUMPGATE_IDLE_TIMEOUT_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("JUMPGATE_IDLE_TIMEOUT_SECS must be an integer (seconds).")?
        {
            relay.idle_timeout = Duration::from_secs(secs.max(1));
        }

        let mut session = SessionConfig {
            relay,
            ..SessionConfig::default()
        };
        if let Some(secs) = lookup("JUMPGATE_MAX_LIFETIME_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("JUMPGATE_MAX_LIFETIME_SECS must be an integer (seconds).")?
        {
            session.max_lifetime = Duration::from_secs(secs.max(1));
        }

        let trace_queries = lookup("JUMPGATE_TRACE_QUERIES")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);
        let query_log = trace_queries.then(|| {
            lookup("JUMPGATE_QUERY_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUERY_LOG))
        });

        let stats_interval = lookup("JUMPGATE_STATS_INTERVAL_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("JUMPGATE_STATS_INTERVAL_SECS must be an integer (seconds).")?
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(DEFAULT_REPORT_INTERVAL);

        Ok(Self {
            routes,
            log_level,
            max_connections,
            pool,
            session,
            query_log,
            query_log_flush_interval: DEFAULT_FLUSH_INTERVAL,
            stats_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    fn route(listen: (&str, u16), remote: (&str, u16)) -> Route {
        Route {
            listen_host: listen.0.to_string(),
            listen_port: listen.1,
            remote_host: remote.0.to_string(),
            remote_port: remote.1,
        }
    }

    #[rstest]
    #[case("127.0.0.1:9000 127.0.0.1:9100", route(("127.0.0.1", 9000), ("127.0.0.1", 9100)))]
    #[case("0.0.0.0:2222\t\tbastion.internal:22", route(("0.0.0.0", 2222), ("bastion.internal", 22)))]
    #[case("127.0.0.1 9000 10.0.0.1 5432", route(("127.0.0.1", 9000), ("10.0.0.1", 5432)))]
    #[case("[::1]:8443 [fd00::7]:443", route(("::1", 8443), ("fd00::7", 443)))]
    #[case("  127.0.0.1:80 10.0.0.2:8080  # web", route(("127.0.0.1", 80), ("10.0.0.2", 8080)))]
    fn test_parse_route_line(#[case] input: &str, #[case] expected: Route) {
        assert_eq!(parse_route_line(1, input).unwrap(), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("# listen remote")]
    fn test_parse_route_line_skips(#[case] input: &str) {
        assert_eq!(parse_route_line(1, input).unwrap(), None);
    }

    #[rstest]
    #[case("127.0.0.1:9000", ConfigError::MalformedRoute { line: 3, content: "127.0.0.1:9000".into() })]
    #[case("127.0.0.1 10.0.0.1:22", ConfigError::MissingPort { line: 3, address: "127.0.0.1".into() })]
    #[case("127.0.0.1:http 10.0.0.1:22", ConfigError::InvalidPort { line: 3, value: "http".into() })]
    #[case("127.0.0.1:0 10.0.0.1:22", ConfigError::InvalidPort { line: 3, value: "0".into() })]
    #[case("127.0.0.1:9000 :22", ConfigError::MissingHost { line: 3, address: ":22".into() })]
    fn test_parse_route_line_errors(#[case] input: &str, #[case] expected: ConfigError) {
        assert_eq!(parse_route_line(3, input).unwrap_err(), expected);
    }

    #[test]
    fn test_parse_routes_dedup_last_wins() {
        let input = "\
127.0.0.1:9000 10.0.0.1:22
127.0.0.1:9001 10.0.0.2:22
127.0.0.1:9000 10.0.0.3:22
";
        let routes = parse_routes(input).unwrap();
        assert_eq!(
            routes,
            vec![
                route(("127.0.0.1", 9000), ("10.0.0.3", 22)),
                route(("127.0.0.1", 9001), ("10.0.0.2", 22)),
            ]
        );
    }

    #[test]
    fn test_parse_routes_empty() {
        assert_eq!(parse_routes("# nothing\n\n").unwrap_err(), ConfigError::NoRoutes);
    }

    #[test]
    fn test_route_addr_formatting() {
        let r = route(("::1", 8443), ("10.0.0.1", 443));
        assert_eq!(r.listen_addr(), "[::1]:8443");
        assert_eq!(r.remote_addr(), "10.0.0.1:443");
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_config_defaults() {
        let config =
            Config::from_lookup(lookup(&[("JUMPGATE_ROUTES", "127.0.0.1:9000 127.0.0.1:9100")]))
                .unwrap();

        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.dial_backoff, Duration::from_secs(2));
        assert_eq!(config.session.relay.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.session.max_lifetime, Duration::from_secs(300));
        assert!(config.query_log.is_none());
        assert_eq!(config.stats_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("JUMPGATE_ROUTES", "127.0.0.1:9000 a:1;127.0.0.1:9001 b:2"),
            ("JUMPGATE_LOG_LEVEL", "debug"),
            ("JUMPGATE_MAX_CONNECTIONS", "64"),
            ("JUMPGATE_IDLE_TIMEOUT_SECS", "5"),
            ("JUMPGATE_MAX_LIFETIME_SECS", "60"),
            ("JUMPGATE_ACQUIRE_TIMEOUT_MS", "750"),
            ("JUMPGATE_DIAL_BACKOFF_MS", "100"),
            ("JUMPGATE_TRACE_QUERIES", "true"),
            ("JUMPGATE_QUERY_LOG", "/tmp/q.log"),
        ]))
        .unwrap();

        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.session.relay.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.session.max_lifetime, Duration::from_secs(60));
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(750));
        assert_eq!(config.pool.dial_backoff, Duration::from_millis(100));
        assert_eq!(config.query_log, Some(PathBuf::from("/tmp/q.log")));
    }

    #[test]
    fn test_config_reads_route_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jumpgate.conf");
        std::fs::write(&path, "127.0.0.1:9000 127.0.0.1:9100\n").unwrap();

        let path = path.to_string_lossy().into_owned();
        let config = Config::from_lookup(lookup(&[("JUMPGATE_ROUTES_FILE", path.as_str())])).unwrap();
        assert_eq!(config.routes[0].remote_port, 9100);
    }

    #[test]
    fn test_config_missing_route_file_fails() {
        let result = Config::from_lookup(lookup(&[(
            "JUMPGATE_ROUTES_FILE",
            "/nonexistent/jumpgate.conf",
        )]));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_rejects_bad_integer() {
        let result = Config::from_lookup(lookup(&[
            ("JUMPGATE_ROUTES", "127.0.0.1:9000 a:1"),
            ("JUMPGATE_IDLE_TIMEOUT_SECS", "soon"),
        ]));
        assert!(result.is_err());
    }
}
