use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::admission::Verdict;
use crate::app::AppState;
use crate::core::generator::TickSource;
use crate::core::session::handle_connection;
use crate::metrics::Metrics;

/// Runs the accept loop and spawns one session task per admitted client.
///
/// Exits once the shared shutdown token is cancelled, after draining
/// in-flight sessions for up to `shutdown_drain_timeout`.
pub async fn run_tcp_server(
    state: AppState,
    tick_source: Arc<dyn TickSource>,
) -> Result<()> {
    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .with_context(|| format!("failed to bind tcp listener on {}", state.config.listen_addr))?;
    info!(listen = %state.config.listen_addr, "tcp server listening");

    let ctx = state.session_context(tick_source);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("tcp server stopping, draining active sessions");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "tcp accept failed");
                        continue;
                    }
                };

                if state.admission.check(peer.ip()) == Verdict::Deny {
                    Metrics::incr(&state.metrics.connections_rejected);
                    info!(peer = %peer, "connection rejected: ip not admitted");
                    continue;
                }
                if state.registry.len() >= state.config.max_connections {
                    Metrics::incr(&state.metrics.connections_rejected);
                    info!(peer = %peer, "connection rejected: max_connections reached");
                    continue;
                }

                if let Err(err) = configure_socket(&stream, state.config.keepalive) {
                    warn!(peer = %peer, error = %err, "failed to configure accepted socket");
                }

                Metrics::incr(&state.metrics.connections_accepted);
                Metrics::incr(&state.metrics.connections_active);

                let ctx = ctx.clone();
                let registry = state.registry.clone();
                let metrics = state.metrics.clone();
                tokio::spawn(async move {
                    handle_connection(stream, peer, ctx, registry).await;
                    Metrics::decr(&metrics.connections_active);
                });
            }
        }
    }

    drain(&state).await;
    Ok(())
}

fn configure_socket(
    stream: &TcpStream,
    keepalive: bool,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = socket2::SockRef::from(stream);
    socket.set_keepalive(keepalive)?;
    if keepalive {
        let params = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
        socket.set_tcp_keepalive(&params)?;
    }
    Ok(())
}

async fn drain(state: &AppState) {
    let deadline = tokio::time::Instant::now() + state.timeouts.shutdown_drain_timeout;
    while state.registry.len() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let remaining = state.registry.len();
    if remaining > 0 {
        warn!(remaining, "shutdown drain timed out, force-closing remaining sessions");
        state.registry.cancel_all();
    } else {
        info!("shutdown drain completed cleanly");
    }
}
