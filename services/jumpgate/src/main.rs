//! jumpgate
//!
//! TCP jump-proxy.
//!
//! This service:
//! - Loads its route table from a file or the environment
//! - Binds one listener per route
//! - Pre-dials a remote connection for every accepted client
//! - Relays bytes both ways under idle and lifetime limits
//! - Optionally traces relayed payloads to a query log

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jumpgate::config::Config;
use jumpgate::proxy::{Listener, ListenerConfig, ProxyServices, RemotePool};
use jumpgate::query_log::{self, QueryLog};
use jumpgate::stats::{self, Stats};

/// How long to wait for sessions to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to JUMPGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting jumpgate");
    info!(
        route_count = config.routes.len(),
        max_connections = config.max_connections,
        idle_timeout_secs = config.session.relay.idle_timeout.as_secs(),
        max_lifetime_secs = config.session.max_lifetime.as_secs(),
        query_log = ?config.query_log,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let pool = Arc::new(RemotePool::with_config(config.pool.clone()));
    let stats = Arc::new(Stats::new());
    let mut services = ProxyServices::new(pool, Arc::clone(&stats));

    let mut background = JoinSet::new();
    background.spawn(stats::run_report_loop(
        Arc::clone(&stats),
        config.stats_interval,
        shutdown.clone(),
    ));

    if let Some(path) = &config.query_log {
        let log = Arc::new(QueryLog::new(path));
        services = services.with_query_log(Arc::clone(&log));
        background.spawn(query_log::run_flush_loop(
            log,
            config.query_log_flush_interval,
            shutdown.clone(),
        ));
    }

    let mut listeners = JoinSet::new();
    for route in &config.routes {
        let mut listener_config = ListenerConfig::new(
            route.listen_addr(),
            route.remote_host.clone(),
            route.remote_port,
        );
        listener_config.max_connections = config.max_connections;
        listener_config.session = config.session.clone();

        match Listener::bind(listener_config, services.clone()).await {
            Ok(listener) => {
                let listener = Arc::new(listener);
                let shutdown = shutdown.clone();
                listeners.spawn(async move {
                    if let Err(e) = listener.run(shutdown).await {
                        error!(error = %e, "Listener error");
                    }
                });
            }
            Err(e) => {
                error!(
                    bind_addr = %route.listen_addr(),
                    error = %e,
                    "Failed to bind listener"
                );
                return Err(e.into());
            }
        }
    }

    wait_for_shutdown_signal().await?;

    info!("Shutting down jumpgate");
    shutdown.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while listeners.join_next().await.is_some() {}
        while background.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(grace_ms = SHUTDOWN_GRACE.as_millis() as u64, "Sessions still open after grace period");
    }

    info!("jumpgate stopped");
    Ok(())
}

/// Wait for SIGINT, SIGTERM or SIGQUIT. SIGHUP is logged and ignored.
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "Received shutdown signal");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "Received shutdown signal");
                return Ok(());
            }
            _ = sigquit.recv() => {
                info!(signal = "SIGQUIT", "Received shutdown signal");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!(signal = "SIGHUP", "Received SIGHUP, reload not supported");
            }
        }
    }
}
