// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG endpoints.
//!
//! - `GET /api/v1/task/dag/{id}`
//! - `POST /api/v1/task/dag/{id}`
//! - `GET /api/v1/task/dag/maintain/agent`

use axum::extract::{Path, Query, State};
use obshell_core::task::{DagDetail, DagOperatorRequest, MaintenanceScope};
use serde::Deserialize;
use tracing::{info, instrument};

use super::parse_dag_id;
use crate::response::{ApiResult, JsonBody, Reply};
use crate::state::ServerState;

/// Query of `GET /api/v1/task/dag/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct DagQuery {
    /// Include nodes, sub-tasks and logs.
    #[serde(default)]
    pub show_detail: bool,
}

/// Snapshot of a DAG.
pub async fn get_dag(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<DagQuery>,
) -> ApiResult<DagDetail> {
    let id = parse_dag_id(&id)?;
    let detail = state.ctx.tasks.get_dag(id, query.show_detail).await?;
    Ok(Reply::data(detail))
}

/// Apply an operator.
#[instrument(skip(state, req), fields(dag_id = %id))]
pub async fn operate_dag(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<DagOperatorRequest>,
) -> ApiResult<DagDetail> {
    let id = parse_dag_id(&id)?;
    info!(operator = %req.operator, "Operator requested");
    let detail = state.ctx.tasks.operate(id, req.operator).await?;
    Ok(Reply::data(detail))
}

/// Newest DAG holding any maintenance scope on this agent.
pub async fn get_maintenance_dag(State(state): State<ServerState>) -> ApiResult<DagDetail> {
    let held = state
        .ctx
        .tasks
        .get_maintenance_dag(&MaintenanceScope::Global)
        .await?;
    Ok(Reply(held))
}
