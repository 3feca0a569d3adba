use axum::{
    extract::{Path, State},
    response::Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::models::{AccessCheckRequest, AccessCheckResponse, CreateCredentialRequest, Credential, CredentialResponse};
use crate::services::access_check_service::run_access_check;
use crate::services::encryption_service::EncryptionService;
use crate::AppState;

fn to_response(credential: Credential) -> CredentialResponse {
    CredentialResponse {
        id: credential.id,
        name: credential.name,
        username: credential.username,
        kind: credential.kind,
        created_at: credential.created_at,
    }
}

fn require_encryption(state: &AppState) -> Result<&EncryptionService, AppError> {
    state
        .encryption
        .as_ref()
        .ok_or_else(|| AppError::Validation("ENCRYPTION_KEY is not configured".to_string()))
}

/// Секрет шифруется до записи и никогда не возвращается наружу
pub async fn create_credential(
    State(state): State<AppState>,
    Json(payload): Json<CreateCredentialRequest>,
) -> Result<Json<CredentialResponse>, AppError> {
    if state.store.credential_name_exists(&payload.name).await? {
        return Err(AppError::Validation(
            "Credential name already exists".to_string(),
        ));
    }

    let encryption = require_encryption(&state)?;
    let encrypted_secret = encryption.encrypt(&payload.secret)?;
    let credential = state
        .store
        .create_credential(&payload.name, &payload.username, payload.kind, &encrypted_secret)
        .await?;

    info!("Created credential '{}'", credential.name);
    Ok(Json(to_response(credential)))
}

pub async fn list_credentials(
    State(state): State<AppState>,
) -> Result<Json<Vec<CredentialResponse>>, AppError> {
    let credentials = state.store.list_credentials().await?;
    Ok(Json(credentials.into_iter().map(to_response).collect()))
}

pub async fn get_credential(
    State(state): State<AppState>,
    Path(credential_id): Path<i64>,
) -> Result<Json<CredentialResponse>, AppError> {
    let credential = state
        .store
        .get_credential(credential_id)
        .await?
        .ok_or_else(|| AppError::not_found("Credential"))?;
    Ok(Json(to_response(credential)))
}

pub async fn delete_credential(
    State(state): State<AppState>,
    Path(credential_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let credential = state
        .store
        .get_credential(credential_id)
        .await?
        .ok_or_else(|| AppError::not_found("Credential"))?;

    let in_use = state.store.clusters_using_credential(credential_id).await?;
    if in_use > 0 {
        return Err(AppError::Validation(format!(
            "Credential is in use by {} cluster(s)",
            in_use
        )));
    }

    state.store.delete_credential(credential_id).await?;
    info!("Deleted credential '{}'", credential.name);
    Ok(Json(json!({ "message": "Credential deleted" })))
}

/// Проверка SSH-доступа до хостов выбранной учёткой
pub async fn test_access(
    State(state): State<AppState>,
    Json(payload): Json<AccessCheckRequest>,
) -> Result<Json<AccessCheckResponse>, AppError> {
    if payload.hosts.is_empty() {
        return Err(AppError::Validation("No hosts provided".to_string()));
    }

    let credential = state
        .store
        .get_credential(payload.credential_id)
        .await?
        .ok_or_else(|| AppError::not_found("Credential"))?;
    let encryption = require_encryption(&state)?;

    let response = run_access_check(&state.config, encryption, &credential, &payload.hosts)
        .await
        .map_err(|err| {
            warn!("Access check failed: {:#}", err);
            AppError::Internal(err)
        })?;

    Ok(Json(response))
}
