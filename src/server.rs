//! WebSocket transport for debug clients.
//!
//! Serves an axum router with:
//! - `GET /`: WebSocket upgrade, one [`SessionBridge`] per connection.
//! - `GET /health`: liveness probe returning `ok`.
//!
//! Inbound text frames are pushed through a [`SequentialQueue`] so that a
//! session handles message *n + 1* only after message *n* settled, while
//! the socket keeps being read. Outbound frames from the debuggee and the
//! output pump share one channel drained by a writer task.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge::{BridgeContext, SessionBridge};
use crate::queue::SequentialQueue;
use crate::{AppError, Result};

/// Client-bound frames buffered per connection before back-pressure.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

/// Build the router serving the bridge endpoints.
pub fn router(ctx: Arc<BridgeContext>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .with_state(ctx)
}

/// Bind `addr` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Transport` if the listener cannot be bound or the
/// server fails.
pub async fn serve(ctx: Arc<BridgeContext>, addr: SocketAddr, ct: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Transport(format!("failed to bind {addr}: {err}")))?;
    serve_listener(ctx, listener, ct).await
}

/// Serve on an already-bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Transport` if the server fails.
pub async fn serve_listener(
    ctx: Arc<BridgeContext>,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Transport(format!("listener has no local address: {err}")))?;
    info!(%local, "debug bridge listening");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(ct.cancelled_owned())
        .await
        .map_err(|err| AppError::Transport(format!("server error: {err}")))?;

    info!("debug bridge transport shut down");
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<BridgeContext>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Drive one client connection until either side goes away.
async fn handle_socket(socket: WebSocket, ctx: Arc<BridgeContext>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!("session", session_id = %session_id);

    async move {
        info!("client connected");

        let (ws_tx, mut ws_rx) = socket.split();
        let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
        let close = CancellationToken::new();

        let session = Arc::new(Mutex::new(SessionBridge::new(
            session_id.clone(),
            ctx,
            out_tx,
            close.clone(),
        )));

        let queue = SequentialQueue::wrap({
            let session = Arc::clone(&session);
            move |text: String| {
                let session = Arc::clone(&session);
                async move { session.lock().await.handle_message(text).await }
            }
        });

        let writer = tokio::spawn(run_writer(ws_tx, out_rx, close.clone()).in_current_span());

        loop {
            tokio::select! {
                () = close.cancelled() => {
                    debug!("session requested close");
                    break;
                }
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            let handled = queue.call(text.as_str().to_owned());
                            tokio::spawn(
                                async move {
                                    if let Err(err) = handled.await {
                                        debug!(%err, "client message not handled");
                                    }
                                }
                                .in_current_span(),
                            );
                        }
                        Some(Ok(Message::Binary(_))) => {
                            warn!("ignoring binary frame; the bridge speaks text only");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("client closed the connection");
                            break;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Err(err)) => {
                            warn!(%err, "websocket read failed");
                            break;
                        }
                    }
                }
            }
        }

        close.cancel();
        session.lock().await.close();
        drop(queue);

        if let Err(err) = writer.await {
            warn!(%err, "websocket writer task failed");
        }
        info!("client disconnected");
    }
    .instrument(span)
    .await;
}

/// Send queued frames to the client; on `close`, flush what is left and
/// send a close frame.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<String>,
    close: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                    debug!("client gone, stopping writer");
                    return;
                }
            }
            () = close.cancelled() => {
                while let Ok(frame) = out_rx.try_recv() {
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    if let Err(err) = ws_tx.send(Message::Close(None)).await {
        debug!(%err, "close frame not delivered");
    }
}
