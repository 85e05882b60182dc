use std::sync::Arc;

use parlor::registry::ConnectionRegistry;
use parlor::{AppState, Config, db, router};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("parlor=debug,tower_http=info")),
        )
        .init();

    let config = Config::from_env();
    let db_pool = db::connect(&config.database_url).await?;

    let state = AppState {
        db_pool,
        registry: Arc::new(ConnectionRegistry::new()),
        config: config.clone(),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
