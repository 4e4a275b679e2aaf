use std::sync::Arc;

use tracing::info;

use chat_sync_service::config::{Config, StoreBackend};
use chat_sync_service::error::AppError;
use chat_sync_service::logging::init_tracing;
use chat_sync_service::routes::build_router;
use chat_sync_service::services::DeliveryEngine;
use chat_sync_service::state::AppState;
use chat_sync_service::store::memory::MemoryStore;
use chat_sync_service::store::postgres::PgStore;
use chat_sync_service::store::{BlockRegistry, MessageStore};
use chat_sync_service::websocket::SessionRegistry;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();
    let config = Config::from_env()?;

    let (store, blocks): (Arc<dyn MessageStore>, Arc<dyn BlockRegistry>) = match &config.backend {
        StoreBackend::Memory => {
            info!("using in-memory store");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        }
        StoreBackend::Postgres { database_url } => {
            info!("using postgres store");
            let store = Arc::new(PgStore::connect(database_url).await?);
            (store.clone(), store)
        }
    };

    let registry = SessionRegistry::new();
    let engine = Arc::new(DeliveryEngine::new(
        store,
        blocks,
        registry,
        config.history_limit,
    ));

    let port = config.port;
    let app = build_router(AppState::new(engine));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;
    info!(%port, "chat sync service listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;
    Ok(())
}
