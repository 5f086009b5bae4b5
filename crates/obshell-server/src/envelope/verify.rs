// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request authentication.
//!
//! A request is admitted by the first of:
//!
//! 1. the administrative socket's peer check ([`super::local`])
//! 2. `OCS_AGENT_HEADER`: this agent's token, the token of a forwarding
//!    agent as registered in the cluster store, or the agent password
//! 3. `OCS_HEADER`: the database root password
//! 4. a live session id in [`SESSION_HEADER`]
//!
//! Headers must be minted for the received URI and must not be expired.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use obshell_core::keyring::Keyring;
use obshell_core::{Error, ErrorKind, Result};
use obshell_security::envelope::{AuthHeader, OCS_AGENT_HEADER, OCS_HEADER};
use obshell_security::password::constant_time_eq;
use tracing::{debug, warn};

use super::local::LocalPeer;
use crate::response::ApiFailure;
use crate::state::ServerState;

/// Header carrying a session id.
pub const SESSION_HEADER: &str = "X-OBSHELL-Session";

/// The verified originator of a request.
#[derive(Debug, Clone)]
pub enum Caller {
    /// A process on the administrative socket.
    LocalPeer(u32),
    /// Holder of a live session.
    Session(String),
    /// Database-authenticated header.
    Database(AuthHeader),
    /// Agent-authenticated header.
    Agent(AuthHeader),
}

impl Caller {
    /// The decrypted header, for header-authenticated callers.
    pub fn header(&self) -> Option<&AuthHeader> {
        match self {
            Self::Database(header) | Self::Agent(header) => Some(header),
            Self::LocalPeer(_) | Self::Session(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::LocalPeer(_) => "local",
            Self::Session(_) => "session",
            Self::Database(_) => "database",
            Self::Agent(_) => "agent",
        }
    }
}

/// Admit or reject a request; admitted requests carry a [`Caller`].
pub async fn verify(State(state): State<ServerState>, mut req: Request, next: Next) -> Response {
    let local = req.extensions().get::<LocalPeer>().copied();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    match authenticate(&state, req.headers(), &uri, local).await {
        Ok(caller) => {
            debug!(caller = caller.kind(), "Request verified");
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => {
            warn!(path = %req.uri().path(), code = e.code(), error = %e, "Request rejected");
            ApiFailure(e).into_response()
        }
    }
}

/// Restrict a route to agent callers and the administrative socket.
pub async fn require_agent(req: Request, next: Next) -> Response {
    match req.extensions().get::<Caller>() {
        Some(Caller::Agent(_)) | Some(Caller::LocalPeer(_)) => next.run(req).await,
        _ => ApiFailure(Error::with_args(
            ErrorKind::SecurityAuthAgent,
            ["agent authentication required"],
        ))
        .into_response(),
    }
}

async fn authenticate(
    state: &ServerState,
    headers: &HeaderMap,
    uri: &str,
    local: Option<LocalPeer>,
) -> Result<Caller> {
    if let Some(peer) = local {
        return Ok(Caller::LocalPeer(peer.uid));
    }

    let now = Utc::now().timestamp();
    let keyring = &state.ctx.keyring;

    if let Some(sealed) = header_value(headers, OCS_AGENT_HEADER)? {
        let header = open(keyring, sealed, uri, now, ErrorKind::SecurityAuthAgent)?;
        verify_agent(state, &header).await?;
        return Ok(Caller::Agent(header));
    }
    if let Some(sealed) = header_value(headers, OCS_HEADER)? {
        let header = open(keyring, sealed, uri, now, ErrorKind::SecurityAuthDb)?;
        keyring.verify_root_password(&header.auth)?;
        return Ok(Caller::Database(header));
    }
    if let Some(id) = header_value(headers, SESSION_HEADER)? {
        keyring.sessions().get(id)?;
        return Ok(Caller::Session(id.to_string()));
    }
    Err(Error::new(ErrorKind::CommonUnauthorized))
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Result<Option<&'h str>> {
    headers
        .get(name)
        .map(|v| {
            v.to_str()
                .map_err(|_| Error::with_args(ErrorKind::SecurityHeaderDecrypt, [name]))
        })
        .transpose()
}

fn open(keyring: &Keyring, sealed: &str, uri: &str, now: i64, expired: ErrorKind) -> Result<AuthHeader> {
    let header = AuthHeader::open(&keyring.key_pair(), sealed)?;
    header.verify_uri(uri)?;
    header
        .verify_fresh(now)
        .map_err(|e| Error::with_args(expired, [e.to_string()]))?;
    Ok(header)
}

async fn verify_agent(state: &ServerState, header: &AuthHeader) -> Result<()> {
    let keyring = &state.ctx.keyring;
    if header.token.is_empty() {
        return keyring.verify_agent_password(&header.auth);
    }
    if !header.is_forwarded() {
        return keyring.verify_token(&header.token);
    }
    let forwarder = header
        .forward_agent
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::SecurityTokenInvalid))?;
    let recorded = state
        .ctx
        .stores
        .cluster
        .get_agent_token(&forwarder.ip, forwarder.port)
        .await?;
    match recorded {
        Some(token) if constant_time_eq(token.as_bytes(), header.token.as_bytes()) => Ok(()),
        _ => {
            warn!(forwarder = %format!("{}:{}", forwarder.ip, forwarder.port), "Forwarder token does not match its record");
            Err(Error::new(ErrorKind::SecurityTokenInvalid))
        }
    }
}
