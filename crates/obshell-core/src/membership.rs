// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master-side bookkeeping of cluster members.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::agent::{AgentAddr, AgentIdentity, AgentRole, AgentState, AgentStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::keyring::Keyring;
use crate::persistence::ClusterStore;

/// Body of `POST /rpc/v1/agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Identity of the joining agent, zone included.
    pub identity: AgentIdentity,
    /// Bearer token the master uses to call the joining agent.
    pub token: String,
}

/// Answer to a join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Identity of the master.
    pub master: AgentIdentity,
    /// Bearer token the follower uses to call the master.
    pub token: String,
}

/// Body of `DELETE /rpc/v1/agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    /// Leaving agent.
    pub agent: AgentAddr,
}

/// Body of `POST /rpc/v1/agent/token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Agent owning the token.
    pub agent: AgentAddr,
    /// New token.
    pub token: String,
}

/// Membership operations served by the master.
#[derive(Clone)]
pub struct Membership {
    cluster: Arc<dyn ClusterStore>,
    agent: AgentState,
    keyring: Arc<Keyring>,
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl Membership {
    /// Membership over `cluster`.
    pub fn new(cluster: Arc<dyn ClusterStore>, agent: AgentState, keyring: Arc<Keyring>) -> Self {
        Self {
            cluster,
            agent,
            keyring,
        }
    }

    /// Register this agent in the cluster store with its own token, so that
    /// calls addressed to itself authenticate like any other.
    pub async fn register_self(&self) -> Result<()> {
        let me = self.agent.get();
        self.upsert(&me, &self.keyring.token()).await
    }

    async fn upsert(&self, identity: &AgentIdentity, token: &str) -> Result<()> {
        match self.cluster.get_agent(&identity.ip, identity.port).await? {
            Some(_) => {
                self.cluster.update_agent(identity).await?;
                self.cluster
                    .set_agent_status(&identity.ip, identity.port, AgentStatus::Active)
                    .await?;
                self.cluster
                    .set_agent_token(&identity.ip, identity.port, token)
                    .await
            }
            None => {
                self.cluster
                    .insert_agent(identity, AgentStatus::Active, token)
                    .await
            }
        }
    }

    /// Accept a joining agent. A SINGLE agent becomes MASTER on its first
    /// join. Re-joining with the same address refreshes the record.
    #[instrument(skip_all, fields(joining = %req.identity.addr()))]
    pub async fn accept_join(&self, req: JoinRequest) -> Result<JoinResponse> {
        let me = self.agent.get();
        if me.is(&req.identity.addr()) {
            return Err(Error::illegal_argument("an agent cannot join itself"));
        }
        match me.role {
            AgentRole::Single => {
                let me = self.agent.update(|id| id.role = AgentRole::Master).await?;
                self.upsert(&me, &self.keyring.token()).await?;
                info!("Promoted to master by first join");
            }
            AgentRole::Master => {}
            other => {
                return Err(Error::with_args(ErrorKind::AgentIdentifyNotSupport, [other]));
            }
        }

        let mut identity = req.identity;
        identity.role = AgentRole::Follower;
        self.upsert(&identity, &req.token).await?;
        info!(zone = %identity.zone, "Agent joined");
        Ok(JoinResponse {
            master: self.agent.get(),
            token: self.keyring.token(),
        })
    }

    /// Remove a member.
    #[instrument(skip_all, fields(leaving = %req.agent))]
    pub async fn accept_leave(&self, req: LeaveRequest) -> Result<()> {
        if self.agent.get().is(&req.agent) {
            return Err(Error::illegal_argument("the master cannot leave itself"));
        }
        if !self.cluster.delete_agent(&req.agent.ip, req.agent.port).await? {
            return Err(Error::with_args(ErrorKind::AgentNotExist, [req.agent]));
        }
        info!("Agent left");
        Ok(())
    }

    /// Replace the token of a registered member.
    pub async fn refresh_token(&self, req: TokenRequest) -> Result<()> {
        self.require_member(&req.agent).await?;
        self.cluster
            .set_agent_token(&req.agent.ip, req.agent.port, &req.token)
            .await
    }

    /// Update the identity record of a registered member.
    pub async fn update_member(&self, identity: AgentIdentity) -> Result<()> {
        self.require_member(&identity.addr()).await?;
        self.cluster.update_agent(&identity).await
    }

    async fn require_member(&self, addr: &AgentAddr) -> Result<()> {
        match self.cluster.get_agent(&addr.ip, addr.port).await? {
            Some(_) => Ok(()),
            None => Err(Error::with_args(ErrorKind::AgentNotExist, [addr])),
        }
    }
}
