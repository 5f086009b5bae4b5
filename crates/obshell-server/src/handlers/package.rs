// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upgrade package endpoints.
//!
//! An upload is a multipart form with a `manifest` JSON part and a `file`
//! part. A `Sha256` request header, when present, replaces the manifest's
//! checksum.

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use obshell_core::package::{PackageInfo, PackageManifest, RouteStep};
use obshell_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::parse_row_id;
use crate::response::{ApiFailure, ApiResult, Reply};
use crate::state::ServerState;

const SHA256_HEADER: HeaderName = HeaderName::from_static("sha256");

/// Query of `GET /api/v1/upgrade/route`.
#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    /// Build currently running.
    pub current: String,
    /// Build to reach.
    pub target: String,
    /// Distribution of the packages.
    pub distribution: String,
    /// Architecture of the packages.
    pub architecture: String,
}

/// One step of a planned upgrade.
#[derive(Debug, Serialize)]
pub struct PlannedStep {
    /// Route step.
    #[serde(flatten)]
    pub step: RouteStep,
    /// Stored package installing it.
    pub package: PackageInfo,
}

/// Store an uploaded package.
#[instrument(skip_all)]
pub async fn upload(
    State(state): State<ServerState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<PackageInfo> {
    let mut manifest: Option<PackageManifest> = None;
    let mut payload: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        match field.name() {
            Some("manifest") => {
                let raw = field.bytes().await.map_err(bad_form)?;
                manifest = Some(serde_json::from_slice(&raw).map_err(|e| {
                    Error::illegal_argument(format!("manifest: {}", e))
                })?);
            }
            Some("file") => payload = Some(field.bytes().await.map_err(bad_form)?),
            _ => {}
        }
    }
    let mut manifest = manifest.ok_or_else(|| Error::illegal_argument("missing manifest part"))?;
    let payload = payload.ok_or_else(|| Error::illegal_argument("missing file part"))?;
    if let Some(sha) = headers.get(SHA256_HEADER).and_then(|v| v.to_str().ok()) {
        manifest.sha256 = sha.trim().to_string();
    }

    let info = state.ctx.packages.upload(manifest, &payload).await?;
    info!(id = info.id, version = %info.version, "Package uploaded");
    Ok(Reply::data(info))
}

fn bad_form(e: axum::extract::multipart::MultipartError) -> Error {
    Error::with_args(ErrorKind::CommonBadRequest, [e.body_text()])
}

/// Every stored package.
pub async fn list(State(state): State<ServerState>) -> ApiResult<Vec<PackageInfo>> {
    Ok(Reply::data(state.ctx.packages.list().await?))
}

/// Header of one package.
pub async fn info(State(state): State<ServerState>, Path(id): Path<String>) -> ApiResult<PackageInfo> {
    let id = parse_row_id(&id)?;
    Ok(Reply::data(state.ctx.packages.info(id).await?))
}

/// Reassembled payload of one package.
pub async fn download(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Response, ApiFailure> {
    let id = parse_row_id(&id)?;
    let info = state.ctx.packages.info(id).await?;
    let payload = state.ctx.packages.fetch(id).await?;
    let disposition = format!(
        "attachment; filename=\"{}-{}-{}.{}.rpm\"",
        info.name, info.version, info.release_distribution, info.architecture
    );
    let mut response = payload.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// Packages to install, in order, to move between two builds.
pub async fn plan_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<RouteQuery>,
) -> ApiResult<Vec<PlannedStep>> {
    let planned = state
        .ctx
        .packages
        .plan_upgrade(&query.current, &query.target, &query.distribution, &query.architecture)
        .await?;
    Ok(Reply::data(
        planned
            .into_iter()
            .map(|(step, record)| PlannedStep {
                step,
                package: record.into(),
            })
            .collect(),
    ))
}
