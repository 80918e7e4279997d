//! WebSocket endpoint.
//!
//! Each socket gets a [`Connection`] whose outbound queue is drained by the
//! socket loop below. Requests are dispatched on their own tasks and answer
//! through the same queue, so a slow command never blocks pushed events.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tracing::{debug, trace, warn};

use crate::server::pool::{Connection, ConnectionPool};
use crate::server::protocol::{Envelope, Request};
use crate::server::registry::HandlerRegistry;
use crate::Error;

/// Heartbeat ping interval in seconds.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Clone)]
pub struct WsState {
    pub registry: Arc<HandlerRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub subscriber_buffer: usize,
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let (conn, mut outbound) = Connection::channel(state.subscriber_buffer);
    debug!(connection = conn.id(), "WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    // The first tick completes immediately.
    heartbeat_interval.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        spawn_request(&state, &conn, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => spawn_request(&state, &conn, text),
                        Err(_) => debug!(connection = conn.id(), "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = conn.id(), error = %e, "WebSocket error");
                        break;
                    }
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    debug!(connection = conn.id(), "Failed to write frame, closing connection");
                    break;
                }
            }

            _ = heartbeat_interval.tick() => {
                if awaiting_pong {
                    debug!(connection = conn.id(), "Client failed to respond to Ping, closing connection");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    state.pool.remove_connection(conn.id());
    let _ = sender.close().await;
    debug!(connection = conn.id(), "WebSocket connection closed");
}

/// Decode one request frame and dispatch it on its own task.
fn spawn_request(state: &WsState, conn: &Connection, text: &str) {
    let request: Request = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(connection = conn.id(), error = %e, "Malformed request frame");
            let envelope = Envelope::request_error(&Error::Decode {
                method: "request".to_string(),
                source: e,
            });
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send_envelope(&envelope).await;
            });
            return;
        }
    };

    let registry = Arc::clone(&state.registry);
    let conn = conn.clone();
    tokio::spawn(async move {
        let Request {
            method,
            message,
            request_id,
        } = request;
        trace!(connection = conn.id(), method = %method, "Dispatching request");

        let envelope = match registry.dispatch(&method, message, conn.clone()).await {
            Ok((method, value)) => Envelope::update(method.to_string(), value),
            Err(e) => {
                debug!(connection = conn.id(), method = %method, error = %e, "Request failed");
                Envelope::request_error(&e)
            }
        };
        conn.send_envelope(&envelope.with_request_id(request_id))
            .await;
    });
}
