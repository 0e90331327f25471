//! The real-time endpoint.
//!
//! - GET /ws - Upgrade to WebSocket and speak the JSON event protocol
//!
//! Each connection gets a bounded outbound queue; a dedicated writer task
//! drains it onto the socket while the read loop parses frames and feeds
//! the dispatcher. Events from one connection are processed sequentially,
//! so a client's own event order is preserved end to end.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use courier_core::error::RelayError;
use courier_core::event::{ClientEvent, ServerEvent};
use courier_core::model::ConnectionId;

use crate::server::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn = ConnectionId::new();
    info!(connection = %conn, "websocket connection established");

    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.outbound_queue_depth);
    let (mut sink, mut stream) = socket.split();

    // Writer task: the only place that touches the socket's send half.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to encode outbound event");
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(connection = %conn, error = %e, "malformed frame");
                        let report =
                            RelayError::InvalidEvent(format!("malformed event: {e}")).to_event();
                        if tx.try_send(report).is_err() {
                            break;
                        }
                        continue;
                    }
                };
                if let Err(err) = state.dispatcher.dispatch(conn, &tx, event).await {
                    match err {
                        RelayError::ConnectionLost(lost) if lost == conn => break,
                        err if err.is_reportable() => {
                            warn!(connection = %conn, error = %err, "event rejected");
                            if tx.try_send(err.to_event()).is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(connection = %conn, "binary frames are not part of the protocol");
            }
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the transport.
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %conn, error = %e, "websocket read error");
                break;
            }
        }
    }

    state.dispatcher.connection_closed(conn).await;
    drop(tx);
    let _ = writer.await;
    info!(connection = %conn, "websocket connection closed");
}
