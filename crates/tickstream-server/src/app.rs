use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionList;
use crate::config::{Config, Timeouts};
use crate::core::auth::RateLimiter;
use crate::core::generator::TickSource;
use crate::core::registry::Registry;
use crate::core::session::SessionContext;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub timeouts: Timeouts,
    pub admission: Arc<AdmissionList>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: Arc<RateLimiter>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn session_context(
        &self,
        tick_source: Arc<dyn TickSource>,
    ) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            max_write_queue_size: self.config.max_write_queue_size,
            read_timeout: self.timeouts.read_timeout,
            write_timeout: self.timeouts.write_timeout,
            auth_timeout: self.timeouts.auth_timeout,
            heartbeat_interval: self.timeouts.heartbeat_interval,
            heartbeat_timeout: self.timeouts.heartbeat_timeout,
            batch_window: self.timeouts.batch_window,
            max_batch_size: self.config.max_batch_size,
            stream_user: self.config.stream_user.clone(),
            stream_pass: self.config.stream_pass.clone(),
            rate_limiter: self.rate_limiter.clone(),
            tick_source,
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        })
    }
}
