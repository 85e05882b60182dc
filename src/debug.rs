//! Read-only introspection endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::SqlitePool;

use crate::AppState;
use crate::error::RelayResult;
use crate::registry::ConnectionRegistry;

pub fn router() -> Router<AppState> {
    Router::new().route("/db", get(db_stats))
}

#[axum::debug_handler(state = AppState)]
async fn db_stats(
    State(pool): State<SqlitePool>,
    State(registry): State<Arc<ConnectionRegistry>>,
) -> RelayResult<Json<serde_json::Value>> {
    let (users,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users").fetch_one(&pool).await?;
    let (rooms,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rooms").fetch_one(&pool).await?;
    let (messages,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM messages").fetch_one(&pool).await?;

    Ok(Json(json!({
        "status": "connected",
        "counts": { "users": users, "rooms": rooms, "messages": messages },
        "connections": registry.connection_count().await,
        "active_rooms": registry.room_count().await,
    })))
}
