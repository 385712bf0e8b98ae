// =============================================================================
// WebSocket Handler — job-scoped fan-out
// =============================================================================
//
// Clients connect to `/ws/pattern-realtime`, then send `{"type":"subscribe",
// "job_id":"..."}` / `{"type":"unsubscribe",...}` / `{"type":"ping"}` frames
// to steer what they receive; `SubscriptionHub` owns all the fan-out and
// backpressure logic. This handler is just the connect/read-loop/disconnect
// shell around it — the push side of each connection is driven entirely by
// the channel `SubscriptionHub::connect` hands back.
//
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};

    let (conn_id, mut outbound) = state.hub.connect();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Push loop: drain whatever the hub queues for us ─────────
            queued = outbound.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(e) = sender.send(message).await {
                            debug!(conn = %conn_id, error = %e, "ws send failed, disconnecting");
                            break;
                        }
                    }
                    None => {
                        // Hub dropped our sender half (e.g. disconnect raced
                        // in from another path); nothing left to push.
                        break;
                    }
                }
            }

            // ── Recv loop: dispatch inbound client frames ───────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.handle_inbound_message(conn_id, &text);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        debug!(conn = %conn_id, "ignoring binary ws frame");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(conn = %conn_id, "ws close frame received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn = %conn_id, error = %e, "ws receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.disconnect(conn_id);
}
