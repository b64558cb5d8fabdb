//! Coalesces ticks into DATA_BATCH frames and detects slow consumers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tickstream_proto::{DataBatch, MessageType, SubscriptionMode, Tick, encode_payload};
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{info, warn};

use crate::core::session::{SessionHandle, WriteError};
use crate::metrics::Metrics;

/// Occupancy threshold (numerator/denominator of channel capacity) above
/// which a sample counts as "congested" towards the slow-consumer trip.
const BACKPRESSURE_NUM: usize = 3;
const BACKPRESSURE_DEN: usize = 4;
/// Consecutive congested samples before a session is declared slow.
const SLOW_CONSUMER_TRIP: u32 = 10;

pub struct DispatcherConfig {
    pub mode: SubscriptionMode,
    pub max_batch_size: usize,
    pub batch_window: Duration,
    pub channel_capacity: usize,
}

/// Runs the batching loop until the tick channel closes (session shutting
/// down) or a slow consumer is declared and the session is closed.
pub async fn run_dispatcher(
    config: DispatcherConfig,
    mut rx: mpsc::Receiver<Tick>,
    tx_for_occupancy: mpsc::Sender<Tick>,
    session: SessionHandle,
    metrics: Arc<Metrics>,
) {
    let sequence = AtomicU64::new(0);
    let mut pending: Vec<Tick> = Vec::new();
    let mut deadline: Option<TokioInstant> = None;
    let mut consecutive_congested: u32 = 0;

    loop {
        let sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            maybe_tick = rx.recv() => {
                let Some(tick) = maybe_tick else {
                    break;
                };

                sample_backpressure(
                    &tx_for_occupancy,
                    config.channel_capacity,
                    &mut consecutive_congested,
                );
                if consecutive_congested >= SLOW_CONSUMER_TRIP {
                    warn!(session_id = %session.id(), "slow consumer: channel backpressure trip");
                    Metrics::incr(&metrics.slow_consumer_disconnects);
                    session.close_as_slow_consumer();
                    break;
                }

                if !tick_mode_matches(&tick, config.mode) {
                    continue;
                }

                if pending.is_empty() {
                    deadline = Some(TokioInstant::now() + config.batch_window);
                }
                pending.push(tick);

                if pending.len() >= config.max_batch_size {
                    flush(&mut pending, &sequence, &session, &metrics).await;
                    deadline = None;
                }
            }
            () = sleep, if deadline.is_some() => {
                flush(&mut pending, &sequence, &session, &metrics).await;
                deadline = None;
            }
        }
    }

    if !pending.is_empty() {
        flush(&mut pending, &sequence, &session, &metrics).await;
    }
}

fn tick_mode_matches(
    tick: &Tick,
    mode: SubscriptionMode,
) -> bool {
    matches!(
        (tick.mode, mode),
        (SubscriptionMode::Second, SubscriptionMode::Second)
            | (SubscriptionMode::Minute, SubscriptionMode::Minute)
    )
}

fn sample_backpressure(
    tx: &mpsc::Sender<Tick>,
    capacity: usize,
    consecutive_congested: &mut u32,
) {
    let occupied = capacity.saturating_sub(tx.capacity());
    if occupied.saturating_mul(BACKPRESSURE_DEN) >= capacity.saturating_mul(BACKPRESSURE_NUM) {
        *consecutive_congested += 1;
    } else {
        *consecutive_congested = 0;
    }
}

async fn flush(
    pending: &mut Vec<Tick>,
    sequence: &AtomicU64,
    session: &SessionHandle,
    metrics: &Arc<Metrics>,
) {
    if pending.is_empty() {
        return;
    }

    let ticks = std::mem::take(pending);
    let batch_sequence = sequence.fetch_add(1, Ordering::SeqCst) + 1;
    let batch = DataBatch {
        ticks,
        batch_sequence,
        batch_timestamp_ms: now_ms(),
        is_snapshot: false,
    };

    let payload = match encode_payload(&batch) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "failed to encode data batch");
            return;
        }
    };

    match session.enqueue_async_frame(MessageType::DataBatch.as_u8(), payload) {
        Ok(()) => {
            Metrics::incr(&metrics.batches_sent);
            info!(
                session_id = %session.id(),
                batch_sequence,
                ticks = batch.ticks.len(),
                "batch dispatched"
            );
        }
        Err(WriteError::QueueFull) => {
            warn!(session_id = %session.id(), "write queue full: marking slow consumer");
            Metrics::incr(&metrics.slow_consumer_disconnects);
            session.close_as_slow_consumer();
        }
        Err(WriteError::Closed) => {}
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tick(mode: SubscriptionMode) -> Tick {
        Tick {
            symbol: "BTC-USD".to_string(),
            timestamp_ms: now_ms(),
            price: 100.0,
            volume: 1.0,
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            mode,
            metadata: None,
        }
    }

    #[test]
    fn mode_filter_rejects_mismatched_ticks() {
        assert!(tick_mode_matches(&sample_tick(SubscriptionMode::Second), SubscriptionMode::Second));
        assert!(!tick_mode_matches(&sample_tick(SubscriptionMode::Minute), SubscriptionMode::Second));
    }

    #[test]
    fn backpressure_sample_counts_congestion() {
        let (tx, _rx) = mpsc::channel::<Tick>(4);
        // 4 slots, 3 reserved via permits held (simulating near-full).
        let _p1 = tx.clone().try_reserve_owned().unwrap();
        let _p2 = tx.clone().try_reserve_owned().unwrap();
        let _p3 = tx.clone().try_reserve_owned().unwrap();
        let mut consecutive = 0;
        sample_backpressure(&tx, 4, &mut consecutive);
        assert_eq!(consecutive, 1);
    }

    #[test]
    fn backpressure_sample_resets_when_not_congested() {
        let (tx, _rx) = mpsc::channel::<Tick>(4);
        let mut consecutive = 5;
        sample_backpressure(&tx, 4, &mut consecutive);
        assert_eq!(consecutive, 0);
    }
}
