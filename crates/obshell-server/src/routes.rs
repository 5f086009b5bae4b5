// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router assembly.

use std::any::Any;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::Uri;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use obshell_core::remote::paths;
use obshell_core::{Error, ErrorKind};
use obshell_security::PeerPolicy;
use tower_http::catch_panic::CatchPanicLayer;

use crate::envelope::body::{MAX_BODY_BYTES, decrypt_body};
use crate::envelope::forward::forward_to_maintainer;
use crate::envelope::local::admit_local_peer;
use crate::envelope::trace::request_envelope;
use crate::envelope::verify::{require_agent, verify};
use crate::handlers::{agent, credential, package, rpc, security, task};
use crate::response::ApiFailure;
use crate::state::ServerState;

/// Router served on the TCP listener.
pub fn create_router(state: ServerState) -> Router {
    build(state, None)
}

/// Router served on the administrative socket: the peer's UID is checked
/// against `policy` before anything else.
pub fn create_local_router(state: ServerState, policy: Arc<PeerPolicy>) -> Router {
    build(state, Some(policy))
}

fn build(state: ServerState, policy: Option<Arc<PeerPolicy>>) -> Router {
    let public = Router::new()
        .route(paths::SECRET, get(security::secret))
        .route(paths::STATUS, get(security::status));

    let api = Router::new()
        .route("/api/v1/login", post(security::login))
        .route("/api/v1/logout", post(security::logout))
        .route(paths::MAINTAIN_DAG, get(task::get_maintenance_dag))
        .route("/api/v1/task/dag/{id}", get(task::get_dag).post(task::operate_dag))
        .route("/api/v1/agent/join", post(agent::join))
        .route("/api/v1/ob/agent/join", post(agent::join))
        .route(
            "/api/v1/security/credential",
            post(credential::create).get(credential::list),
        )
        .route("/api/v1/security/credential/batch", delete(credential::batch_delete))
        .route(
            "/api/v1/security/credential/encrypt-secret-key",
            put(credential::rotate_secret_key),
        )
        .route(
            "/api/v1/security/credential/{id}",
            get(credential::get)
                .patch(credential::patch)
                .delete(credential::delete),
        )
        .route("/api/v1/security/credential/{id}/validate", post(credential::validate))
        .route(
            "/api/v1/package",
            post(package::upload)
                .get(package::list)
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .route(
            "/api/v1/upgrade/package",
            post(package::upload).layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .route("/api/v1/upgrade/route", get(package::plan_upgrade))
        .route("/api/v1/package/{id}", get(package::info))
        .route("/api/v1/package/{id}/payload", get(package::download))
        .route_layer(from_fn(decrypt_body))
        .route_layer(from_fn_with_state(state.clone(), verify));

    let on_maintainer = Router::new()
        .route(
            paths::AGENT,
            post(agent::accept_join).delete(agent::accept_leave),
        )
        .route(paths::AGENT_TOKEN, post(agent::refresh_token))
        .route(paths::AGENT_UPDATE, post(agent::update_member))
        .route(paths::TASK_LOG, post(rpc::insert_task_logs))
        .route_layer(from_fn_with_state(state.clone(), forward_to_maintainer));

    let rpc = Router::new()
        .route(paths::MAINTAINER, get(agent::maintainer))
        .route(paths::MAINTAINER_UPDATE, post(agent::update_maintainer))
        .route(paths::SUB_DAG, post(rpc::create_sub_dag))
        .merge(on_maintainer)
        .route_layer(from_fn(require_agent))
        .route_layer(from_fn(decrypt_body))
        .route_layer(from_fn_with_state(state.clone(), verify));

    let mut router = Router::new()
        .merge(public)
        .merge(api)
        .merge(rpc)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handler_panicked));
    if let Some(policy) = policy {
        router = router.layer(from_fn_with_state(policy, admit_local_peer));
    }
    router.layer(from_fn(request_envelope)).with_state(state)
}

async fn not_found(uri: Uri) -> ApiFailure {
    ApiFailure(Error::with_args(ErrorKind::CommonNotFound, [uri.path()]))
}

fn handler_panicked(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("handler panicked");
    ApiFailure(Error::unexpected(message)).into_response()
}
