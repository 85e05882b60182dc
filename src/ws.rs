//! Push ingress: one WebSocket per client, join/leave/message events in,
//! message/error events out.
//!
//! Failures never close the socket; they come back as an `error` event on
//! the same connection. Each inbound chat message is ingested on its own
//! task so one slow persistence call cannot stall the read loop.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RelayError;
use crate::ingest::{self, IngestRequest};
use crate::messages::store::MessagePayload;
use crate::registry::ConnectionId;
use crate::rooms::directory;
use crate::{AppState, db};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Join { room: String },
    Leave { room: String },
    Message(IngestRequest),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
    },
    Message {
        #[serde(flatten)]
        message: MessagePayload,
    },
    Error {
        kind: &'static str,
        detail: String,
    },
}

impl From<RelayError> for ServerEvent {
    fn from(err: RelayError) -> Self {
        ServerEvent::Error { kind: err.kind(), detail: err.to_string() }
    }
}

#[axum::debug_handler]
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn = state.registry.register(tx.clone()).await;
    debug!(%conn, "connection opened");
    let _ = tx.send(ServerEvent::Connected { connection_id: conn });

    let outbound = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Message::Text(text) = frame else {
            continue;
        };

        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(ClientEvent::Join { room }) => {
                match db::store_call(directory::resolve(&state.db_pool, &room)).await {
                    Ok(room) => state.registry.subscribe(conn, room.id).await,
                    Err(err) => {
                        let _ = tx.send(err.into());
                    }
                }
            }
            Ok(ClientEvent::Leave { room }) => {
                // Leaving a room nobody created is a no-op, not an error.
                match db::store_call(directory::find(&state.db_pool, &room)).await {
                    Ok(Some(room)) => state.registry.unsubscribe(conn, room.id).await,
                    Ok(None) => {}
                    Err(err) => {
                        let _ = tx.send(err.into());
                    }
                }
            }
            Ok(ClientEvent::Message(req)) => {
                let state = state.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let policy = state.config.ingest_policy();
                    if let Err(err) =
                        ingest::ingest(&state.db_pool, &state.registry, policy, req).await
                    {
                        let _ = tx.send(err.into());
                    }
                });
            }
            Err(err) => {
                let _ = tx.send(ServerEvent::Error {
                    kind: "invalid_input",
                    detail: format!("unparseable event: {err}"),
                });
            }
        }
    }

    // The read loop ended, so this runs exactly once per connection.
    state.registry.on_disconnect(conn).await;
    outbound.abort();
    debug!(%conn, "connection closed");
}
