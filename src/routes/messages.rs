use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::BlockState;
use crate::state::AppState;
use crate::websocket::message_types::MessagePayload;

#[derive(Deserialize)]
pub struct HistoryParams {
    pub u1: String,
    pub u2: String,
    /// Which participant's view to render; defaults to `u1`.
    pub viewer: Option<String>,
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> AppResult<Json<Vec<MessagePayload>>> {
    let viewer = params.viewer.as_deref().unwrap_or(&params.u1);
    if viewer != params.u1 && viewer != params.u2 {
        return Err(AppError::InvalidRequest(
            "viewer must be one of the two participants".into(),
        ));
    }
    let messages = state.engine.history(&params.u1, &params.u2, viewer).await?;
    Ok(Json(messages.iter().map(MessagePayload::from).collect()))
}

#[derive(Deserialize)]
pub struct ClearParams {
    pub u1: String,
}

pub async fn clear_conversation(
    State(state): State<AppState>,
    Path(other): Path<String>,
    Query(params): Query<ClearParams>,
) -> AppResult<StatusCode> {
    state.engine.clear_conversation(&params.u1, &other).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ToggleBlockRequest {
    pub blocker: String,
    pub blocked: String,
}

#[derive(Serialize)]
pub struct ToggleBlockResponse {
    pub blocked: bool,
}

pub async fn toggle_block(
    State(state): State<AppState>,
    Json(body): Json<ToggleBlockRequest>,
) -> AppResult<Json<ToggleBlockResponse>> {
    if body.blocker == body.blocked {
        return Err(AppError::InvalidRequest("cannot block yourself".into()));
    }
    let blocked = state.engine.toggle_block(&body.blocker, &body.blocked).await?;
    Ok(Json(ToggleBlockResponse { blocked }))
}

#[derive(Deserialize)]
pub struct BlockStateParams {
    pub u1: String,
    pub u2: String,
}

#[derive(Serialize)]
pub struct BlockStateResponse {
    pub state: BlockState,
}

pub async fn get_block_state(
    State(state): State<AppState>,
    Query(params): Query<BlockStateParams>,
) -> AppResult<Json<BlockStateResponse>> {
    let block_state = state.engine.block_state(&params.u1, &params.u2).await?;
    Ok(Json(BlockStateResponse { state: block_state }))
}
