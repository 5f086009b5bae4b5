// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sub-tasks turning a SINGLE agent into a follower of a master.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentAddr, AgentIdentity, AgentRole, AgentState, AgentStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::keyring::Keyring;
use crate::membership::{JoinRequest, JoinResponse, LeaveRequest};
use crate::persistence::ClusterStore;
use crate::task::{
    Executable, ExecutionEnv, MaintenanceScope, NodeTemplate, TaskContext, TaskFlags, TaskResult,
    Template,
};

use super::client::{RpcAuth, RpcClient};
use super::paths;

/// Registered type of [`JoinToMaster`].
pub const JOIN_TO_MASTER: &str = "JoinToMaster";
/// Registered type of [`BeFollower`].
pub const BE_FOLLOWER: &str = "BeFollower";

/// Param: master to join.
pub const MASTER_KEY: &str = "master";
/// Param: zone of the joining agent.
pub const ZONE_KEY: &str = "zone";
/// Param: agent password of the master.
pub const PASSWORD_KEY: &str = "password";
/// DAG data: the master's answer.
pub const JOIN_RESPONSE_KEY: &str = "join_response";

/// Body of `POST /api/v1/agent/join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinApiRequest {
    /// Master to join.
    pub master: AgentAddr,
    /// Zone of this agent.
    pub zone: String,
    /// Agent password of the master.
    #[serde(default)]
    pub password: String,
}

/// The two-node join DAG and its context.
pub fn join_template(req: &JoinApiRequest) -> Result<(Template, TaskContext)> {
    if req.zone.is_empty() {
        return Err(Error::illegal_argument("zone is empty"));
    }
    let template = Template::builder("Join cluster")
        .scope(MaintenanceScope::Global)
        .node(NodeTemplate::single(JOIN_TO_MASTER))
        .node(NodeTemplate::single(BE_FOLLOWER))
        .build()?;
    let context = TaskContext::new()
        .with_param(MASTER_KEY, &req.master)?
        .with_param(ZONE_KEY, &req.zone)?
        .with_param(PASSWORD_KEY, &req.password)?;
    Ok((template, context))
}

/// Flags the join types are registered with.
pub fn join_flags() -> TaskFlags {
    TaskFlags::new().rollbackable()
}

fn joining_identity(env: &ExecutionEnv) -> Result<AgentIdentity> {
    let mut identity = env.agent().clone();
    identity.zone = env.param(ZONE_KEY)?;
    Ok(identity)
}

/// Registers this agent and its token on the master.
#[derive(Debug, Clone)]
pub struct JoinToMaster {
    client: RpcClient,
    keyring: Arc<Keyring>,
}

impl JoinToMaster {
    /// Task calling the master through `client`.
    pub fn new(client: RpcClient, keyring: Arc<Keyring>) -> Self {
        Self { client, keyring }
    }
}

#[async_trait]
impl Executable for JoinToMaster {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        if env.agent().role != AgentRole::Single {
            return Err(Error::with_args(ErrorKind::AgentIdentifyNotSupport, [env.agent().role]).into());
        }
        let master: AgentAddr = env.param(MASTER_KEY)?;
        let password: String = env.param_opt(PASSWORD_KEY)?.unwrap_or_default();
        let req = JoinRequest {
            identity: joining_identity(env)?,
            token: self.keyring.token(),
        };
        env.log(format!("joining master {} in zone {}", master, req.identity.zone));
        let resp: JoinResponse = self
            .client
            .call(Method::POST, &master, paths::AGENT, &RpcAuth::AgentPassword(password), Some(&req))
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::AgentRpcFailed, [master.to_string(), "empty join answer".to_string()]))?;
        env.log(format!("master {} accepted the join", resp.master.addr()));
        env.set_dag_data(JOIN_RESPONSE_KEY, &resp)?;
        Ok(())
    }

    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        let master: AgentAddr = env.param(MASTER_KEY)?;
        let password: String = env.param_opt(PASSWORD_KEY)?.unwrap_or_default();
        let req = LeaveRequest {
            agent: env.agent().addr(),
        };
        let res: Result<Option<Value>> = self
            .client
            .call(Method::DELETE, &master, paths::AGENT, &RpcAuth::AgentPassword(password), Some(&req))
            .await;
        match res {
            Ok(_) => env.log(format!("left master {}", master)),
            Err(e) if super::client::remote_code(&e) == Some(ErrorKind::AgentNotExist.code()) => {
                env.log(format!("master {} has no record of this agent", master));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Switches this agent to FOLLOWER and records the master's token.
#[derive(Clone)]
pub struct BeFollower {
    agent: AgentState,
    cluster: Arc<dyn ClusterStore>,
}

impl BeFollower {
    /// Task updating `agent` and recording the master in `cluster`.
    pub fn new(agent: AgentState, cluster: Arc<dyn ClusterStore>) -> Self {
        Self { agent, cluster }
    }
}

impl std::fmt::Debug for BeFollower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeFollower")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executable for BeFollower {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        let resp: JoinResponse = env
            .dag_data(JOIN_RESPONSE_KEY)?
            .ok_or_else(|| Error::with_args(ErrorKind::TaskParamNotSet, [JOIN_RESPONSE_KEY]))?;
        let zone: String = env.param(ZONE_KEY)?;

        let master = resp.master;
        match self.cluster.get_agent(&master.ip, master.port).await? {
            Some(_) => {
                self.cluster.update_agent(&master).await?;
                self.cluster
                    .set_agent_token(&master.ip, master.port, &resp.token)
                    .await?;
            }
            None => {
                self.cluster
                    .insert_agent(&master, AgentStatus::Active, &resp.token)
                    .await?;
            }
        }
        let me = self
            .agent
            .update(|id| {
                id.role = AgentRole::Follower;
                id.zone = zone;
            })
            .await?;
        env.log(format!("now a follower of {} in zone {}", master.addr(), me.zone));
        Ok(())
    }

    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        self.agent
            .update(|id| {
                id.role = AgentRole::Single;
                id.zone.clear();
            })
            .await?;
        env.log("back to single");
        Ok(())
    }
}
