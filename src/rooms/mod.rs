//! Room listing, explicit creation, and lookup endpoints.

pub mod directory;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::error::{RelayError, RelayResult};
use crate::{AppState, db};

use directory::Room;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rooms).post(create_room))
        .route("/{identifier}", get(get_room))
}

#[axum::debug_handler(state = AppState)]
async fn list_rooms(State(pool): State<SqlitePool>) -> RelayResult<Json<Vec<Room>>> {
    Ok(Json(db::store_call(directory::list(&pool)).await?))
}

#[derive(Deserialize)]
struct CreateRoom {
    name: String,
}

/// Explicit creation shares resolve semantics: creating a name that already
/// exists returns the existing room.
#[axum::debug_handler(state = AppState)]
async fn create_room(
    State(pool): State<SqlitePool>,
    Json(CreateRoom { name }): Json<CreateRoom>,
) -> RelayResult<impl IntoResponse> {
    let room = db::store_call(directory::resolve_name(&pool, name.trim())).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

#[axum::debug_handler(state = AppState)]
async fn get_room(
    Path(identifier): Path<String>,
    State(pool): State<SqlitePool>,
) -> RelayResult<Json<Room>> {
    match db::store_call(directory::find(&pool, &identifier)).await? {
        Some(room) => Ok(Json(room)),
        None => Err(RelayError::UnknownRoom(identifier)),
    }
}
