// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Join, membership and maintainer endpoints.

use axum::Extension;
use axum::extract::State;
use obshell_core::agent::AgentIdentity;
use obshell_core::membership::{JoinRequest, JoinResponse, LeaveRequest, TokenRequest};
use obshell_core::remote::join::{JoinApiRequest, join_template};
use obshell_core::task::DagDetail;
use tracing::{info, instrument};

use crate::envelope::RequestMeta;
use crate::response::{ApiResult, JsonBody, Reply};
use crate::state::ServerState;

/// `POST /api/v1/agent/join`: start the join DAG on this agent.
#[instrument(skip_all)]
pub async fn join(
    State(state): State<ServerState>,
    Extension(meta): Extension<RequestMeta>,
    JsonBody(req): JsonBody<JoinApiRequest>,
) -> ApiResult<DagDetail> {
    let (template, context) = join_template(&req)?;
    let dag = state
        .ctx
        .tasks
        .create_dag_by_template(&template, &context, &[], &meta.trace_id)
        .await?;
    info!(dag_id = %dag.id, master = %req.master, zone = %req.zone, "Join started");
    Ok(Reply::data(dag))
}

/// `POST /rpc/v1/agent`: record a joining agent.
pub async fn accept_join(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<JoinRequest>,
) -> ApiResult<JoinResponse> {
    let resp = state.ctx.membership.accept_join(req).await?;
    state.ctx.coordinator.request_publish();
    Ok(Reply::data(resp))
}

/// `DELETE /rpc/v1/agent`: remove a member.
pub async fn accept_leave(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<LeaveRequest>,
) -> ApiResult<()> {
    state.ctx.membership.accept_leave(req).await?;
    state.ctx.coordinator.request_publish();
    Ok(Reply::empty())
}

/// `POST /rpc/v1/agent/token`: replace a member's token.
pub async fn refresh_token(
    State(state): State<ServerState>,
    JsonBody(req): JsonBody<TokenRequest>,
) -> ApiResult<()> {
    state.ctx.membership.refresh_token(req).await?;
    Ok(Reply::empty())
}

/// `POST /rpc/v1/agent/update`: update a member's identity record.
pub async fn update_member(
    State(state): State<ServerState>,
    JsonBody(identity): JsonBody<AgentIdentity>,
) -> ApiResult<()> {
    state.ctx.membership.update_member(identity).await?;
    Ok(Reply::empty())
}

/// `GET /rpc/v1/maintainer`.
pub async fn maintainer(State(state): State<ServerState>) -> ApiResult<AgentIdentity> {
    Ok(Reply(state.ctx.coordinator.maintainer()))
}

/// `POST /rpc/v1/maintainer/update`: re-evaluate now and publish.
pub async fn update_maintainer(State(state): State<ServerState>) -> ApiResult<AgentIdentity> {
    let maintainer = state.ctx.coordinator.evaluate().await?;
    state.ctx.coordinator.publish();
    Ok(Reply(maintainer))
}
