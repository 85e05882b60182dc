//! Identity Service: user lookup for the ingestion pipeline, plus the thin
//! register/login endpoints the original deployment ships.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::error::{RelayError, RelayResult};

/// Resolve a user id to its username, if the user exists.
pub async fn lookup(pool: &SqlitePool, user_id: i64) -> RelayResult<Option<String>> {
    Ok(
        sqlx::query_as::<_, (String,)>("SELECT username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?
            .map(|(username,)| username),
    )
}

/// Auto-provision a user under a fixed id. Only reachable when the
/// deployment enables the provisioning policy. Provisioned users carry an
/// empty credential and cannot log in until they register.
pub async fn provision(pool: &SqlitePool, user_id: i64, username: &str) -> RelayResult<String> {
    sqlx::query(
        "INSERT INTO users (id, username, password_hash) VALUES (?, ?, '') \
         ON CONFLICT DO NOTHING",
    )
    .bind(user_id)
    .bind(username)
    .execute(pool)
    .await?;

    // A username collision leaves the insert a no-op and the id unknown.
    lookup(pool, user_id)
        .await?
        .ok_or(RelayError::UnknownUser(user_id))
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[axum::debug_handler(state = crate::AppState)]
pub async fn register(
    State(pool): State<SqlitePool>,
    Json(creds): Json<Credentials>,
) -> RelayResult<impl IntoResponse> {
    let username = creds.username.trim().to_owned();
    if username.is_empty() || creds.password.is_empty() {
        return Err(RelayError::InvalidInput("username and password are required".into()));
    }

    let password = creds.password;
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
        .await
        .map_err(anyhow::Error::from)?
        .map_err(anyhow::Error::from)?;

    let result = sqlx::query("INSERT INTO users (username, password_hash) VALUES (?, ?)")
        .bind(&username)
        .bind(&hash)
        .execute(&pool)
        .await;

    match result {
        Ok(done) => Ok((
            StatusCode::CREATED,
            Json(json!({ "user_id": done.last_insert_rowid(), "username": username })),
        )),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(RelayError::InvalidInput(format!("username {username:?} is already taken")))
        }
        Err(err) => Err(err.into()),
    }
}

#[axum::debug_handler(state = crate::AppState)]
pub async fn login(
    State(pool): State<SqlitePool>,
    Json(creds): Json<Credentials>,
) -> RelayResult<impl IntoResponse> {
    let row: Option<(i64, String, String)> =
        sqlx::query_as("SELECT id, username, password_hash FROM users WHERE username = ?")
            .bind(creds.username.trim())
            .fetch_optional(&pool)
            .await?;

    let Some((user_id, username, hash)) = row else {
        return Err(RelayError::InvalidCredentials);
    };

    let password = creds.password;
    let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(anyhow::Error::from)?
        .unwrap_or(false);

    if !ok {
        return Err(RelayError::InvalidCredentials);
    }

    Ok(Json(json!({ "user_id": user_id, "username": username })))
}
