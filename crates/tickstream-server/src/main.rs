use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tickstream_helpers::{logging, shutdown};
use tickstream_server::admission::AdmissionList;
use tickstream_server::app::AppState;
use tickstream_server::config::Config;
use tickstream_server::core::acceptor::run_tcp_server;
use tickstream_server::core::auth::RateLimiter;
use tickstream_server::core::generator::{SyntheticTickSource, TickSource};
use tickstream_server::core::registry::Registry;
use tickstream_server::metrics::Metrics;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    logging::init_logging(
        "tickstream_server=info,tokio=warn",
        "TICKSTREAM_LOG",
        "tickstream-server",
    );

    let config = Config::load().context("failed to load configuration")?;
    let timeouts = config.timeouts();
    let admission = Arc::new(
        AdmissionList::parse(&config.ip_allowlist, &config.ip_blocklist)
            .context("failed to parse ip admission lists")?,
    );
    let rate_limiter = Arc::new(RateLimiter::new(timeouts.auth_rate_limit_window, config.auth_max_attempts));

    let state = AppState {
        config: Arc::new(config),
        timeouts,
        admission,
        registry: Arc::new(Registry::new()),
        metrics: Arc::new(Metrics::new()),
        rate_limiter,
        shutdown: CancellationToken::new(),
    };

    info!(
        listen = %state.config.listen_addr,
        max_connections = state.config.max_connections,
        "server starting"
    );

    tokio::spawn(shutdown::listen_shutdown(state.shutdown.clone()));
    tokio::spawn(rate_limiter_gc_loop(state.rate_limiter.clone(), state.shutdown.clone()));

    let tick_source: Arc<dyn TickSource> = Arc::new(SyntheticTickSource::new());
    run_tcp_server(state, tick_source).await
}

/// Periodically sweeps rate-limiter entries idle for over an hour so the
/// map doesn't grow unbounded under churn from many distinct source IPs.
async fn rate_limiter_gc_loop(
    rate_limiter: Arc<RateLimiter>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => rate_limiter.garbage_collect(),
        }
    }
}
