use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Blinded token already signed")]
    TokenReused,

    #[error("Model in request body mismatch, expected {expected}")]
    ModelMismatch { expected: String },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid token")]
    BadToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Cannot reuse token for a different request")]
    RequestMismatch,

    #[error("No quota left")]
    NoQuota,

    #[error("Missing or invalid session")]
    Unauthorized,

    #[error("Unsupported content part: {0}")]
    UnsupportedPart(String),

    #[error("Upstream call failed with status {status}")]
    Upstream { status: u16 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] llmmask_crypto::CryptoError),

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(ref e) => {
                tracing::debug!("Bad request: {}", e);
                (StatusCode::BAD_REQUEST, "Bad request")
            }
            AppError::TokenReused => (StatusCode::BAD_REQUEST, "Blinded token already signed"),
            AppError::ModelMismatch { .. } => {
                (StatusCode::BAD_REQUEST, "Model in request body mismatch")
            }
            AppError::UnknownModel(ref model) => {
                tracing::debug!("Unknown model: {}", model);
                (StatusCode::NOT_FOUND, "Unknown model")
            }
            AppError::BadToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AppError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AppError::RequestMismatch => (
                StatusCode::CONFLICT,
                "Cannot reuse token for a different request",
            ),
            AppError::NoQuota => (StatusCode::PAYMENT_REQUIRED, "No quota left"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Missing or invalid session"),
            AppError::UnsupportedPart(ref kind) => {
                tracing::debug!("Unsupported content part: {}", kind);
                (StatusCode::BAD_REQUEST, "Unsupported content part")
            }
            AppError::Upstream { status } => {
                tracing::error!("Upstream call failed with status {}", status);
                (StatusCode::BAD_GATEWAY, "Upstream service error")
            }
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
            }
            AppError::Crypto(ref e) => {
                tracing::error!("Crypto error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cryptographic error")
            }
            AppError::Request(ref e) => {
                tracing::error!("Request error: {:?}", e);
                (StatusCode::BAD_GATEWAY, "External service error")
            }
            AppError::Config(ref e) => {
                tracing::error!("Config error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error")
            }
            AppError::Internal(ref e) => {
                tracing::error!("Internal error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string(),
        }));

        (status, body).into_response()
    }
}
