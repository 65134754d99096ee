use crate::sfu::SfuError;
use crate::transport::TransportError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use fanout_protocol::ProtocolError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<SfuError> for AppError {
    fn from(e: SfuError) -> Self {
        let message = e.to_string();
        match e {
            SfuError::RoomNotFound(_) => AppError::NotFound(message),
            SfuError::TrackTimeout(_) => AppError::Unavailable(message),
            SfuError::Transport(TransportError::Negotiation(msg)) => AppError::BadRequest(msg),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<ProtocolError> for AppError {
    fn from(e: ProtocolError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
