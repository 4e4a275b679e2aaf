use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::store::StoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("message not sent: you are blocked or have blocked this user")]
    Blocked,

    #[error("not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bulk operation failed at chunk {chunk}: {source}")]
    Batch { chunk: usize, source: StoreError },
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Blocked => 403,
            AppError::NotFound => 404,
            AppError::InvalidRequest(_) => 400,
            AppError::Store(StoreError::NotFound) => 404,
            AppError::Store(_) | AppError::Batch { .. } => 503,
            AppError::Config(_) | AppError::StartServer(_) => 500,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_maps_to_403() {
        assert_eq!(AppError::Blocked.status_code(), 403);
    }

    #[test]
    fn store_unavailable_maps_to_503() {
        let err = AppError::Store(StoreError::Unavailable("down".into()));
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn missing_message_maps_to_404() {
        assert_eq!(AppError::NotFound.status_code(), 404);
        assert_eq!(AppError::Store(StoreError::NotFound).status_code(), 404);
    }
}
