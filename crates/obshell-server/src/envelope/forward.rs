// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay of maintainer-only requests received by another agent.
//!
//! The forwarding agent has already verified the caller. It re-issues the
//! request to the maintainer under its own token with `ForwardType=AUTO`
//! and relays the maintainer's response unchanged. A request that was
//! itself forwarded is never forwarded again.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use obshell_core::remote::ForwardRequest;
use obshell_core::{Error, ErrorKind};
use obshell_security::{AuthHeader, ForwardAgent, ForwardType};
use tracing::info;

use super::body::PlainBody;
use super::trace::RequestMeta;
use super::verify::Caller;
use crate::response::{ApiFailure, pending};
use crate::state::ServerState;

/// Serve locally on the maintainer, forward everywhere else.
pub async fn forward_to_maintainer(State(state): State<ServerState>, req: Request, next: Next) -> Response {
    let coordinator = &state.ctx.coordinator;
    if coordinator.is_maintainer() {
        return next.run(req).await;
    }
    let already_forwarded = req
        .extensions()
        .get::<Caller>()
        .and_then(Caller::header)
        .map(AuthHeader::is_forwarded)
        .unwrap_or(false);
    if already_forwarded {
        return ApiFailure(Error::new(ErrorKind::AgentMaintainerNotActive)).into_response();
    }
    let maintainer = match coordinator.require_maintainer() {
        Ok(maintainer) => maintainer.addr(),
        Err(e) => return ApiFailure(e).into_response(),
    };

    let method = req.method().clone();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let trace_id = req
        .extensions()
        .get::<RequestMeta>()
        .map(|meta| meta.trace_id.clone())
        .unwrap_or_default();
    let body = req
        .extensions()
        .get::<PlainBody>()
        .map(|plain| plain.0.clone())
        .filter(|plain| !plain.is_empty());
    drop(req);

    let me = state.ctx.agent.addr();
    let token = state.ctx.keyring.token();
    info!(maintainer = %maintainer, uri = %uri, "Forwarding to maintainer");
    let forwarded = state
        .ctx
        .client
        .forward(
            &maintainer,
            ForwardRequest {
                method,
                uri: &uri,
                body: body.as_deref(),
                trace_id: &trace_id,
                forwarder: ForwardAgent {
                    ip: me.ip,
                    port: me.port,
                },
                token: &token,
                forward_type: ForwardType::Auto,
            },
        )
        .await;
    match forwarded {
        Ok(resp) => pending(resp),
        Err(e) => ApiFailure(e).into_response(),
    }
}
