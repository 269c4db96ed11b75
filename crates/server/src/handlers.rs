use crate::error::AppError;
use crate::ledger::{IssueTokenRequest, IssueTokenResponse};
use crate::models::UserRecord;
use crate::proxy::ProxyResponse;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    Extension, Json,
};
use serde::Serialize;
use serde_json::{json, Value};

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "llmmask-server"
    }))
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    #[serde(rename = "ModelName")]
    pub model_name: String,
    #[serde(rename = "PublicKeyPEM")]
    pub public_key_pem: String,
}

/// Clients need the model's public key to blind tokens and verify
/// unblinded signatures.
pub async fn get_public_key(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<PublicKeyResponse>, AppError> {
    let public_key_pem = state.keys.public_key_pem(&model)?;
    Ok(Json(PublicKeyResponse {
        model_name: model,
        public_key_pem,
    }))
}

pub async fn issue_token(
    State(state): State<AppState>,
    Extension(user): Extension<UserRecord>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, AppError> {
    let response = state.ledger.issue(&user.id, &req).await?;
    Ok(Json(response))
}

/// Anonymous by design: no session here, only the token envelope inside
/// the body.
pub async fn llm_proxy(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ProxyResponse>, AppError> {
    let response = state.proxy.serve(&body).await?;
    Ok(Json(response))
}
