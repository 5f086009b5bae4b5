// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task RPC between agents.

use axum::extract::State;
use obshell_core::persistence::ShippedLog;
use obshell_core::remote::executable::SubDagRequest;
use obshell_core::task::DagDetail;
use tracing::{debug, info};

use crate::response::{ApiResult, JsonBody, Reply};
use crate::state::ServerState;

/// `POST /rpc/v1/task/sub_dag`: run a DAG on behalf of a peer.
pub async fn create_sub_dag(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<SubDagRequest>,
) -> ApiResult<DagDetail> {
    let dag = state
        .ctx
        .tasks
        .create_dag_by_template(&req.template, &req.context, &[], &req.trace_id)
        .await?;
    info!(dag_id = %dag.id, marker = %req.trace_id, "Sub-DAG created for peer");
    Ok(Reply::data(dag))
}

/// `POST /rpc/v1/task/log`: insert log rows shipped by a follower.
pub async fn insert_task_logs(
    State(state): State<ServerState>,
    JsonBody(logs): JsonBody<Vec<ShippedLog>>,
) -> ApiResult<()> {
    state.ctx.stores.cluster.insert_shipped_logs(&logs).await?;
    debug!(count = logs.len(), "Shipped logs stored");
    Ok(Reply::empty())
}
