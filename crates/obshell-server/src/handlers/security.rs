// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public key, status, login and logout.

use std::collections::HashMap;
use std::time::Duration;

use axum::Extension;
use axum::extract::State;
use chrono::{DateTime, Utc};
use obshell_core::agent::{AgentAddr, AgentIdentity};
use obshell_core::remote::AgentSecret;
use obshell_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::info;

use crate::envelope::Caller;
use crate::response::{ApiResult, Reply};
use crate::state::{AgentLifecycle, ServerState};

const SQL_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// Reachability of the database process next to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObState {
    /// SQL port accepts connections.
    ConnectionAvailable,
    /// SQL port accepts connections but logins are refused.
    ConnectionRestricted,
    /// Process is up, SQL port not yet open.
    ProcessRunning,
    /// Nothing answers.
    ProcessNotRunning,
}

/// Payload of `GET /api/v1/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    /// Agent lifecycle.
    pub state: AgentLifecycle,
    /// Database reachability.
    pub ob_state: ObState,
    /// This agent.
    pub agent: AgentIdentity,
    /// Database SQL port.
    pub sql_port: u16,
    /// Current maintainer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintainer: Option<AgentAddr>,
}

/// Payload of `POST /api/v1/login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginView {
    /// Session id encrypted with the body keys of the login header.
    pub session_id: String,
    /// Expiry unless used again.
    pub expires_at: DateTime<Utc>,
}

/// The agent's RSA public key.
pub async fn secret(State(state): State<ServerState>) -> ApiResult<AgentSecret> {
    Ok(Reply::data(AgentSecret {
        public_key: state.ctx.keyring.public_pem()?,
    }))
}

/// Liveness, identity and database reachability.
pub async fn status(State(state): State<ServerState>) -> ApiResult<StatusView> {
    let agent = state.ctx.agent.get();
    let ob_state = probe_sql(&agent.ip, agent.sql_port).await;
    Ok(Reply::data(StatusView {
        state: state.lifecycle(),
        ob_state,
        sql_port: agent.sql_port,
        maintainer: state.ctx.coordinator.maintainer().map(|m| m.addr()),
        agent,
    }))
}

async fn probe_sql(ip: &str, port: u16) -> ObState {
    match tokio::time::timeout(SQL_PROBE_TIMEOUT, TcpStream::connect((ip, port))).await {
        Ok(Ok(_)) => ObState::ConnectionAvailable,
        _ => ObState::ProcessNotRunning,
    }
}

/// Open a session for a database-authenticated caller.
pub async fn login(
    State(state): State<ServerState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<LoginView> {
    let Caller::Database(header) = &caller else {
        return Err(Error::with_args(
            ErrorKind::SecurityAuthDb,
            ["login requires the database password"],
        )
        .into());
    };
    let keys = header
        .body_keys()?
        .ok_or_else(|| Error::illegal_argument("login requires body keys"))?;
    let session = state
        .ctx
        .keyring
        .sessions()
        .create(HashMap::from([("user".to_string(), Value::from("root"))]));
    info!(expires_at = %session.expires_at, "Session opened");
    Ok(Reply::data(LoginView {
        session_id: keys.encrypt(session.id.as_bytes()),
        expires_at: session.expires_at,
    }))
}

/// Close the caller's session.
pub async fn logout(
    State(state): State<ServerState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<()> {
    let Caller::Session(id) = &caller else {
        return Err(Error::new(ErrorKind::SecuritySessionInvalid).into());
    };
    state.ctx.keyring.sessions().remove(id);
    info!("Session closed");
    Ok(Reply::empty())
}
