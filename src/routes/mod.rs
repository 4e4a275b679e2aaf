use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::websocket::handlers::ws_handler;

pub mod messages;
use messages::{clear_conversation, get_block_state, get_history, toggle_block};

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/messages", get(get_history))
        .route("/chat/:other", delete(clear_conversation))
        .route("/user/block", post(toggle_block))
        .route("/user/block_state", get(get_block_state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
