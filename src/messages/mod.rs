//! Request/response ingress and the history projection.

pub mod store;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::error::{RelayError, RelayResult};
use crate::ingest::{self, IngestRequest};
use crate::registry::ConnectionRegistry;
use crate::rooms::directory;
use crate::{AppState, Config, db};

use store::{DEFAULT_HISTORY_LIMIT, MessagePayload};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(send_message))
        .route("/{room}", get(history))
}

/// Ingress A: submit one message, get the persisted record back.
#[axum::debug_handler(state = AppState)]
async fn send_message(
    State(pool): State<SqlitePool>,
    State(registry): State<Arc<ConnectionRegistry>>,
    State(config): State<Config>,
    Json(req): Json<IngestRequest>,
) -> RelayResult<Json<MessagePayload>> {
    let payload = ingest::ingest(&pool, &registry, config.ingest_policy(), req).await?;
    Ok(Json(payload))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

/// Most recent messages for a room, oldest first. Side-effect free: an
/// unknown room is a 404, never a creation.
#[axum::debug_handler(state = AppState)]
async fn history(
    Path(room): Path<String>,
    Query(HistoryQuery { limit }): Query<HistoryQuery>,
    State(pool): State<SqlitePool>,
) -> RelayResult<Json<Vec<MessagePayload>>> {
    let Some(room) = db::store_call(directory::find(&pool, &room)).await? else {
        return Err(RelayError::UnknownRoom(room));
    };

    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
    let rows = db::store_call(store::history(&pool, room.id, limit)).await?;

    Ok(Json(
        rows.into_iter()
            .map(|message| message.into_payload(room.name.clone()))
            .collect(),
    ))
}
