//! Per-connection state machine: read loop, write queue, heartbeat and auth
//! timers. Three tasks run for an authenticated session (read loop,
//! generator, write drainer); a fourth (the batching dispatcher) sits
//! between the generator and the write queue so batching cadence never
//! blocks tick production.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tickstream_proto::{
    AckPayload, ErrorCode, ErrorPayload, HeartbeatRequest, MessageType, PongPayload,
    SubscribeRequest, decode_async, decode_payload, encode_payload, validate_heartbeat_request,
    validate_subscribe_request,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant as TokioInstant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::auth::{RateLimitOutcome, RateLimiter, credentials_match, log_auth_outcome};
use crate::core::dispatcher::{self, DispatcherConfig};
use crate::core::generator::{self, TICK_CHANNEL_CAPACITY, TickSource};
use crate::core::registry::Registry;
use crate::core::subscription::{SetSubscriptionError, SubscriptionSlot};
use crate::metrics::Metrics;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Authenticated,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    QueueFull,
    Closed,
    FrameTooLarge,
}

/// Shared, per-connection resources handed in by the acceptor. Cheap to
/// construct: everything inside is a clone of a process-wide `Arc`.
pub struct SessionContext {
    pub max_write_queue_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub batch_window: Duration,
    pub max_batch_size: usize,
    pub stream_user: String,
    pub stream_pass: String,
    pub rate_limiter: Arc<RateLimiter>,
    pub tick_source: Arc<dyn TickSource>,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
}

/// Handle shared between the read loop and the dispatcher/generator tasks
/// it spawns once a session reaches `Streaming`.
pub struct ConnectionSession {
    id: SessionId,
    remote_addr: SocketAddr,
    subscription: SubscriptionSlot,
    write_tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    frames_out: AtomicU64,
    bytes_out: AtomicU64,
    session_cancel: CancellationToken,
}

pub type SessionHandle = Arc<ConnectionSession>;

impl ConnectionSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Non-blocking enqueue used by the dispatcher for DATA_BATCH frames.
    /// Overflow is a backpressure signal, never a wait.
    pub fn enqueue_async_frame(
        &self,
        kind: u8,
        payload: Vec<u8>,
    ) -> Result<(), WriteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriteError::Closed);
        }
        let bytes = tickstream_proto::encode(kind, &payload).map_err(|_| WriteError::FrameTooLarge)?;
        let len = bytes.len() as u64;
        match self.write_tx.try_send(bytes) {
            Ok(()) => {
                self.frames_out.fetch_add(1, Ordering::Relaxed);
                self.bytes_out.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(WriteError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WriteError::Closed),
        }
    }

    /// Blocking-with-timeout enqueue for control-plane replies (AUTH ACK,
    /// ERROR, PONG). These are rare and small; a bounded wait is fine.
    async fn send_sync_frame(
        &self,
        kind: u8,
        payload: &[u8],
        write_timeout: Duration,
    ) -> Result<(), WriteError> {
        let bytes = tickstream_proto::encode(kind, payload).map_err(|_| WriteError::FrameTooLarge)?;
        let len = bytes.len() as u64;
        match timeout(write_timeout, self.write_tx.send(bytes)).await {
            Ok(Ok(())) => {
                self.frames_out.fetch_add(1, Ordering::Relaxed);
                self.bytes_out.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(WriteError::Closed),
            Err(_) => Err(WriteError::Closed),
        }
    }

    pub fn close_as_slow_consumer(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.session_cancel.cancel();
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.session_cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.session_cancel.clone()
    }
}

/// Drains the write queue onto the socket half, one frame at a time, until
/// the channel closes, the session is cancelled, or a write stalls past
/// `write_timeout`.
///
/// Takes only the session id and cancellation token, never a strong
/// `SessionHandle`: `ConnectionSession` owns the sender half of `rx`, so a
/// clone of the handle held across the whole loop would keep that sender
/// alive for as long as this task runs, and `rx.recv()` could then never
/// observe a closed channel on a graceful, empty-queue close (auth timeout,
/// heartbeat timeout, idle shutdown). Racing `rx.recv()` against
/// `cancel.cancelled()` gives the loop a way out in that case.
async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
    session_id: SessionId,
    cancel: CancellationToken,
    session: std::sync::Weak<ConnectionSession>,
) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match timeout(write_timeout, writer.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(session_id = %session_id, error = %err, "write failed, closing session");
                if let Some(session) = session.upgrade() {
                    session.close();
                } else {
                    cancel.cancel();
                }
                break;
            }
            Err(_) => {
                warn!(session_id = %session_id, "write stalled past deadline, closing session");
                if let Some(session) = session.upgrade() {
                    session.close();
                } else {
                    cancel.cancel();
                }
                break;
            }
        }
    }
    // Drain whatever is already queued without blocking so a clean shutdown
    // still flushes pending frames instead of dropping them silently.
    while let Ok(bytes) = rx.try_recv() {
        if timeout(write_timeout, writer.write_all(&bytes)).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Accepts one connection, drives its lifetime to completion, and only
/// returns once every task it spawned has wound down.
pub async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    registry: Arc<Registry>,
) {
    let id = Uuid::new_v4();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = BufWriter::new(write_half);

    let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(ctx.max_write_queue_size);
    let session_cancel = CancellationToken::new();

    let session = Arc::new(ConnectionSession {
        id,
        remote_addr,
        subscription: SubscriptionSlot::new(),
        write_tx,
        closed: AtomicBool::new(false),
        frames_out: AtomicU64::new(0),
        bytes_out: AtomicU64::new(0),
        session_cancel: session_cancel.clone(),
    });
    registry.insert(id, session.cancel_token());

    let writer_task = tokio::spawn(run_writer(
        writer,
        write_rx,
        ctx.write_timeout,
        id,
        session.cancel_token(),
        Arc::downgrade(&session),
    ));

    run_read_loop(&mut reader, &session, &ctx).await;

    session.close();
    // `run_writer` only holds a `Weak` plus the cancel token, so it can't
    // keep `write_tx` alive past this point; any spawned generator/dispatcher
    // still hold their own strong clones, wound down by the cancellation
    // above rather than by `write_tx` closing.
    let _ = writer_task.await;
    registry.remove(id);
    info!(session_id = %id, peer = %remote_addr, "session closed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Auth,
    Heartbeat,
}

async fn run_read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    session: &SessionHandle,
    ctx: &Arc<SessionContext>,
) {
    let mut state = SessionState::New;
    let mut deadline_kind = Deadline::Auth;
    let mut deadline = TokioInstant::now() + ctx.auth_timeout;
    let mut streaming_tasks: Option<(tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>)> = None;
    let mut last_heartbeat: Option<TokioInstant> = None;

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!(session_id = %session.id(), "read loop stopping: server shutdown");
                break;
            }
            _ = session.session_cancel.cancelled() => {
                debug!(session_id = %session.id(), "read loop stopping: session cancelled");
                break;
            }
            () = tokio::time::sleep_until(deadline) => {
                match deadline_kind {
                    Deadline::Auth => {
                        send_error(session, ErrorCode::AuthRequired, "no AUTH frame before deadline", ctx.write_timeout).await;
                    }
                    Deadline::Heartbeat => {
                        send_error(session, ErrorCode::HeartbeatTimeout, "no heartbeat before deadline", ctx.write_timeout).await;
                    }
                }
                break;
            }
            frame_result = timeout(ctx.read_timeout, decode_async(reader)) => {
                let frame = match frame_result {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(_frame_err)) => {
                        // The stream is no longer trustworthy at the byte level
                        // (bad magic/version/length/checksum): any reply we
                        // wrote would itself be unsynchronized. Close silently.
                        debug!(session_id = %session.id(), "closing on frame decode error");
                        break;
                    }
                    Err(_elapsed) => {
                        debug!(session_id = %session.id(), "closing on idle read timeout");
                        break;
                    }
                };

                match process_frame(frame, &mut state, session, ctx, &mut last_heartbeat).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Close => break,
                    FrameOutcome::EnteredStreaming { mode } => {
                        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
                        let tick_tx_for_occupancy = tick_tx.clone();
                        let gen_handle = tokio::spawn(generator::run_generator(
                            mode,
                            tick_tx,
                            ctx.tick_source.clone(),
                            ctx.metrics.clone(),
                            session.session_cancel.clone(),
                        ));
                        let dispatch_handle = tokio::spawn(dispatcher::run_dispatcher(
                            DispatcherConfig {
                                mode,
                                max_batch_size: ctx.max_batch_size,
                                batch_window: ctx.batch_window,
                                channel_capacity: TICK_CHANNEL_CAPACITY,
                            },
                            tick_rx,
                            tick_tx_for_occupancy,
                            session.clone(),
                            ctx.metrics.clone(),
                        ));
                        streaming_tasks = Some((gen_handle, dispatch_handle));
                    }
                }

                match state {
                    SessionState::New => {}
                    SessionState::Authenticated | SessionState::Streaming => {
                        if matches!(deadline_kind, Deadline::Auth) {
                            deadline_kind = Deadline::Heartbeat;
                        }
                        if matches!(deadline_kind, Deadline::Heartbeat) && matches!(state, SessionState::Authenticated | SessionState::Streaming) {
                            // Reset on every authenticated-state frame, not just
                            // HEARTBEAT: any traffic is proof of life.
                            deadline = TokioInstant::now() + ctx.heartbeat_timeout;
                        }
                    }
                }
            }
        }
    }

    if let Some((gen_handle, dispatch_handle)) = streaming_tasks {
        gen_handle.abort();
        dispatch_handle.abort();
    }
}

enum FrameOutcome {
    Continue,
    Close,
    EnteredStreaming { mode: tickstream_proto::SubscriptionMode },
}

async fn process_frame(
    frame: tickstream_proto::Frame,
    state: &mut SessionState,
    session: &SessionHandle,
    ctx: &Arc<SessionContext>,
    last_heartbeat: &mut Option<TokioInstant>,
) -> FrameOutcome {
    let message_type = tickstream_proto::MessageType::try_from(frame.kind);

    if *state == SessionState::New {
        if !matches!(message_type, Ok(MessageType::Auth)) {
            send_error(session, ErrorCode::AuthRequired, "first frame must be AUTH", ctx.write_timeout).await;
            return FrameOutcome::Close;
        }
        return handle_auth(frame.payload, state, session, ctx).await;
    }

    match message_type {
        Ok(MessageType::Auth) => handle_auth(frame.payload, state, session, ctx).await,
        Ok(MessageType::Subscribe) => handle_subscribe(frame.payload, state, session, ctx).await,
        Ok(MessageType::Heartbeat) => handle_heartbeat(frame.payload, session, ctx, last_heartbeat).await,
        Ok(_other) => {
            send_error(session, ErrorCode::InvalidMessageType, "server-only message type from client", ctx.write_timeout).await;
            FrameOutcome::Continue
        }
        Err(_unknown) => {
            send_error(session, ErrorCode::InvalidMessageType, "unrecognized message type byte", ctx.write_timeout).await;
            FrameOutcome::Continue
        }
    }
}

async fn handle_auth(
    payload: Vec<u8>,
    state: &mut SessionState,
    session: &SessionHandle,
    ctx: &Arc<SessionContext>,
) -> FrameOutcome {
    match *state {
        SessionState::Authenticated => {
            send_error(session, ErrorCode::AlreadyAuthenticated, "session is already authenticated", ctx.write_timeout).await;
            return FrameOutcome::Continue;
        }
        SessionState::Streaming => {
            send_error(session, ErrorCode::InvalidSequence, "AUTH is not valid once streaming", ctx.write_timeout).await;
            return FrameOutcome::Continue;
        }
        SessionState::New => {}
    }

    let ip = session.remote_addr().ip();
    if ctx.rate_limiter.record_attempt(ip) == RateLimitOutcome::Limited {
        Metrics::incr(&ctx.metrics.rate_limit_trips);
        send_error(session, ErrorCode::RateLimited, "too many AUTH attempts, slow down", ctx.write_timeout).await;
        return FrameOutcome::Close;
    }

    let request: tickstream_proto::AuthRequest = match decode_payload(&payload) {
        Ok(req) => req,
        Err(_) => {
            send_error(session, ErrorCode::InvalidMessage, "malformed AUTH payload", ctx.write_timeout).await;
            return FrameOutcome::Close;
        }
    };
    if let Err(err) = tickstream_proto::validate_auth_request(&request) {
        send_error(session, ErrorCode::InvalidMessage, &err.to_string(), ctx.write_timeout).await;
        return FrameOutcome::Close;
    }

    if !credentials_match(&ctx.stream_user, &ctx.stream_pass, &request) {
        Metrics::incr(&ctx.metrics.auth_failures);
        log_auth_outcome(ip, false);
        send_error(session, ErrorCode::InvalidAuth, "bad credentials", ctx.write_timeout).await;
        return FrameOutcome::Close;
    }

    ctx.rate_limiter.reset(ip);
    Metrics::incr(&ctx.metrics.auth_successes);
    log_auth_outcome(ip, true);
    *state = SessionState::Authenticated;

    let ack = AckPayload { ack_type: "AUTH".to_string(), success: true, timestamp_ms: now_ms() };
    match encode_payload(&ack) {
        Ok(bytes) => {
            let _ = session.send_sync_frame(MessageType::Ack.as_u8(), &bytes, ctx.write_timeout).await;
        }
        Err(err) => warn!(session_id = %session.id(), error = %err, "failed to encode AUTH ack"),
    }
    FrameOutcome::Continue
}

async fn handle_subscribe(
    payload: Vec<u8>,
    state: &mut SessionState,
    session: &SessionHandle,
    ctx: &Arc<SessionContext>,
) -> FrameOutcome {
    let request: SubscribeRequest = match decode_payload(&payload) {
        Ok(req) => req,
        Err(_) => {
            send_error(session, ErrorCode::InvalidMessage, "malformed SUBSCRIBE payload", ctx.write_timeout).await;
            return FrameOutcome::Continue;
        }
    };
    if let Err(err) = validate_subscribe_request(&request) {
        send_error(session, ErrorCode::InvalidSubscription, &err.to_string(), ctx.write_timeout).await;
        return FrameOutcome::Continue;
    }

    match session.subscription.set(request.mode) {
        Ok(()) => {
            *state = SessionState::Streaming;
            let ack = AckPayload {
                ack_type: "SUBSCRIBE".to_string(),
                success: true,
                timestamp_ms: now_ms(),
            };
            if let Ok(bytes) = encode_payload(&ack) {
                let _ = session.send_sync_frame(MessageType::Ack.as_u8(), &bytes, ctx.write_timeout).await;
            }
            FrameOutcome::EnteredStreaming { mode: request.mode }
        }
        Err(SetSubscriptionError::AlreadySubscribed) => {
            send_error(session, ErrorCode::AlreadySubscribed, "already subscribed in this mode", ctx.write_timeout).await;
            FrameOutcome::Continue
        }
        Err(SetSubscriptionError::ModeMismatch) => {
            send_error(session, ErrorCode::InvalidSubscription, "subscription mode cannot change", ctx.write_timeout).await;
            FrameOutcome::Continue
        }
    }
}

async fn handle_heartbeat(
    payload: Vec<u8>,
    session: &SessionHandle,
    ctx: &Arc<SessionContext>,
    last_heartbeat: &mut Option<TokioInstant>,
) -> FrameOutcome {
    let request: HeartbeatRequest = match decode_payload(&payload) {
        Ok(req) => req,
        Err(_) => {
            send_error(session, ErrorCode::InvalidMessage, "malformed HEARTBEAT payload", ctx.write_timeout).await;
            return FrameOutcome::Continue;
        }
    };
    let now = now_ms();
    if let Err(err) = validate_heartbeat_request(&request, now) {
        send_error(session, ErrorCode::InvalidMessage, &err.to_string(), ctx.write_timeout).await;
        return FrameOutcome::Continue;
    }

    let arrived_at = TokioInstant::now();
    if let Some(previous) = *last_heartbeat {
        let since_previous = arrived_at.saturating_duration_since(previous);
        if since_previous < ctx.heartbeat_interval / 2 {
            debug!(
                session_id = %session.id(),
                since_previous_ms = since_previous.as_millis(),
                "heartbeat flood: arrived well under heartbeat_interval / 2, not rejected"
            );
        }
    }
    *last_heartbeat = Some(arrived_at);

    let pong = PongPayload { client_ts: request.timestamp_ms, server_ts: now, sequence: request.sequence };
    if let Ok(bytes) = encode_payload(&pong) {
        let _ = session.send_sync_frame(MessageType::Pong.as_u8(), &bytes, ctx.write_timeout).await;
    }
    FrameOutcome::Continue
}

async fn send_error(
    session: &SessionHandle,
    code: ErrorCode,
    message: &str,
    write_timeout: Duration,
) {
    let payload = ErrorPayload { code, message: message.to_string() };
    match encode_payload(&payload) {
        Ok(bytes) => {
            let _ = session.send_sync_frame(MessageType::Error.as_u8(), &bytes, write_timeout).await;
        }
        Err(err) => warn!(session_id = %session.id(), error = %err, "failed to encode ERROR payload"),
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn handle_for_test() -> (SessionHandle, mpsc::Receiver<Vec<u8>>) {
        let (write_tx, write_rx) = mpsc::channel(4);
        let session = Arc::new(ConnectionSession {
            id: Uuid::new_v4(),
            remote_addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9000),
            subscription: SubscriptionSlot::new(),
            write_tx,
            closed: AtomicBool::new(false),
            frames_out: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            session_cancel: CancellationToken::new(),
        });
        (session, write_rx)
    }

    #[tokio::test]
    async fn enqueue_async_frame_rejects_after_close() {
        let (session, _rx) = handle_for_test();
        session.close();
        let err = session.enqueue_async_frame(MessageType::DataBatch.as_u8(), b"{}".to_vec()).unwrap_err();
        assert_eq!(err, WriteError::Closed);
    }

    #[tokio::test]
    async fn enqueue_async_frame_reports_queue_full() {
        let (session, _rx) = handle_for_test();
        for _ in 0..4 {
            session.enqueue_async_frame(MessageType::DataBatch.as_u8(), b"{}".to_vec()).unwrap();
        }
        let err = session.enqueue_async_frame(MessageType::DataBatch.as_u8(), b"{}".to_vec()).unwrap_err();
        assert_eq!(err, WriteError::QueueFull);
    }

    #[tokio::test]
    async fn slow_consumer_close_cancels_session_token() {
        let (session, _rx) = handle_for_test();
        assert!(!session.session_cancel.is_cancelled());
        session.close_as_slow_consumer();
        assert!(session.session_cancel.is_cancelled());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn writer_exits_on_cancel_with_empty_queue_and_no_strong_handle() {
        let (session, write_rx) = handle_for_test();
        let cancel = session.cancel_token();
        let id = session.id();
        let weak = Arc::downgrade(&session);
        // Drop the only strong handle held by this test; only the writer's
        // `Weak` and the spawned task's locals can reference the session now.
        drop(session);

        let sink = tokio::io::sink();
        let writer_task = tokio::spawn(run_writer(sink, write_rx, Duration::from_secs(1), id, cancel.clone(), weak));

        cancel.cancel();
        timeout(Duration::from_secs(1), writer_task)
            .await
            .expect("run_writer must exit once cancelled, even with an empty queue")
            .unwrap();
    }
}
