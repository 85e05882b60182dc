pub mod broadcast;
pub mod db;
pub mod debug;
pub mod error;
pub mod ingest;
pub mod messages;
pub mod registry;
pub mod rooms;
pub mod uploads;
pub mod users;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::FromRef;
use axum::routing::{get, post};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::ingest::IngestPolicy;
use crate::registry::ConnectionRegistry;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub registry: Arc<ConnectionRegistry>,
    pub config: Config,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub provision_users: bool,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            database_url: dotenv::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://parlor.db".to_owned()),
            port: dotenv::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(3000),
            upload_dir: dotenv::var("UPLOAD_DIR")
                .unwrap_or_else(|_| "uploads".to_owned())
                .into(),
            provision_users: dotenv::var("PROVISION_USERS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn ingest_policy(&self) -> IngestPolicy {
        IngestPolicy { provision_users: self.provision_users }
    }
}

pub fn router(state: AppState) -> Router {
    let upload_dir = state.config.upload_dir.clone();

    Router::new()
        .route("/register", post(users::register))
        .route("/login", post(users::login))
        .route("/upload", post(uploads::upload))
        .route("/ws", get(ws::ws_handler))
        .nest("/rooms", rooms::router())
        .nest("/messages", messages::router())
        .nest("/debug", debug::router())
        .nest_service("/uploads", ServeDir::new(upload_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
