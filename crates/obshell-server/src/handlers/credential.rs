// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SSH credential endpoints under `/api/v1/security/credential`.

use axum::extract::{Path, Query, State};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use obshell_core::Error;
use obshell_core::credential::{CreateCredential, CredentialView, PatchCredential, ValidationResult};
use obshell_security::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::parse_row_id;
use crate::response::{ApiResult, JsonBody, Reply};
use crate::state::ServerState;

/// Query of the list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Restrict to one target type.
    pub target_type: Option<String>,
}

/// Body of `DELETE /credential/batch`.
#[derive(Debug, Deserialize)]
pub struct BatchDelete {
    /// Credential ids.
    pub ids: Vec<i64>,
}

/// Outcome of a batch delete.
#[derive(Debug, Serialize)]
pub struct Deleted {
    /// Rows removed.
    pub deleted: u64,
}

/// Body of `PUT /credential/encrypt-secret-key`.
#[derive(Debug, Deserialize)]
pub struct RotateKey {
    /// New key, base64 of 32 bytes.
    pub secret_key: String,
}

/// Outcome of a key rotation.
#[derive(Debug, Serialize)]
pub struct Rotated {
    /// Credentials re-wrapped under the new key.
    pub rewrapped: usize,
}

/// Create a credential.
pub async fn create(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<CreateCredential>,
) -> ApiResult<CredentialView> {
    let view = state.ctx.credentials.create(req).await?;
    info!(id = view.id, "Credential created");
    Ok(Reply::data(view))
}

/// List credentials.
pub async fn list(
    State(state): State<ServerState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<CredentialView>> {
    let views = state.ctx.credentials.list(query.target_type.as_deref()).await?;
    Ok(Reply::data(views))
}

/// One credential.
pub async fn get(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<CredentialView> {
    let id = parse_row_id(&id)?;
    Ok(Reply::data(state.ctx.credentials.get(id).await?))
}

/// Patch a credential.
pub async fn patch(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<PatchCredential>,
) -> ApiResult<CredentialView> {
    let id = parse_row_id(&id)?;
    Ok(Reply::data(state.ctx.credentials.patch(id, req).await?))
}

/// Delete a credential.
pub async fn delete(State(state): State<ServerState>, Path(id): Path<String>) -> ApiResult<()> {
    let id = parse_row_id(&id)?;
    state.ctx.credentials.delete(id).await?;
    info!(id, "Credential deleted");
    Ok(Reply::empty())
}

/// Delete several credentials.
pub async fn batch_delete(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<BatchDelete>,
) -> ApiResult<Deleted> {
    let deleted = state.ctx.credentials.batch_delete(&req.ids).await?;
    Ok(Reply::data(Deleted { deleted }))
}

/// Probe a credential's endpoints over SSH.
pub async fn validate(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ValidationResult>> {
    let id = parse_row_id(&id)?;
    Ok(Reply::data(state.ctx.credentials.validate(id).await?))
}

/// Replace the cluster secret key.
#[instrument(skip_all)]
pub async fn rotate_secret_key(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<RotateKey>,
) -> ApiResult<Rotated> {
    let raw = STANDARD
        .decode(req.secret_key.trim())
        .map_err(|e| Error::illegal_argument(format!("secret_key: {}", e)))?;
    let key = SecretKey::from_bytes(&raw)?;
    let rewrapped = state.ctx.credentials.rotate_secret_key(key).await?;
    info!(rewrapped, "Secret key rotated");
    Ok(Reply::data(Rotated { rewrapped }))
}
