//! Per-subscription tick generator: one ticker per session, bound to that
//! session's lifetime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tickstream_proto::{SubscriptionMode, Tick};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::Metrics;

/// Capacity of the per-session tick channel between generator and dispatcher.
pub const TICK_CHANNEL_CAPACITY: usize = 100;

const SYMBOLS: &[&str] = &["BTC-USD", "ETH-USD", "SOL-USD", "TICK-SPEC"];

/// Produces one [`Tick`] per call. The synthetic implementation shipped here
/// can be swapped for a real feed by implementing this trait.
pub trait TickSource: Send + Sync {
    fn next_tick(
        &self,
        mode: SubscriptionMode,
    ) -> Tick;
}

/// Deterministic-shape, pseudo-random-valued tick source used in the absence
/// of a real market data feed.
#[derive(Debug, Default)]
pub struct SyntheticTickSource {
    cursor: AtomicU64,
}

impl SyntheticTickSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TickSource for SyntheticTickSource {
    fn next_tick(
        &self,
        mode: SubscriptionMode,
    ) -> Tick {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % SYMBOLS.len();
        let symbol = SYMBOLS[idx].to_string();
        let mut rng = rand::thread_rng();
        let price = rng.gen_range(1.0..100_000.0_f64);
        let volume = rng.gen_range(0.0..10_000.0_f64);
        let spread = price * 0.0005;

        Tick {
            symbol,
            timestamp_ms: now_ms(),
            price,
            volume,
            bid: Some(price - spread),
            ask: Some(price + spread),
            bid_size: Some(rng.gen_range(0.0..1_000.0_f64)),
            ask_size: Some(rng.gen_range(0.0..1_000.0_f64)),
            mode,
            metadata: None,
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn period_for_mode(mode: SubscriptionMode) -> Duration {
    match mode {
        SubscriptionMode::Second => Duration::from_secs(1),
        SubscriptionMode::Minute => Duration::from_secs(60),
        SubscriptionMode::Unspecified => Duration::from_secs(1),
    }
}

/// Runs the generator loop until `shutdown` is cancelled or the tick channel
/// is dropped. Overflow is a drop-and-count signal, never a wait.
pub async fn run_generator(
    mode: SubscriptionMode,
    tx: mpsc::Sender<Tick>,
    source: Arc<dyn TickSource>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(period_for_mode(mode));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("tick generator stopping: shutdown");
                break;
            }
            _ = ticker.tick() => {
                let tick = source.next_tick(mode);
                match tx.try_send(tick) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        Metrics::incr(&metrics.ticks_dropped);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("tick generator stopping: channel closed");
                        break;
                    }
                }
            }
        }
    }
}
