// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage barriers between a main DAG and the sub-DAGs it opens on peers.
//!
//! The main DAG on the maintainer runs [`CreateSubDags`] to open one sub-DAG
//! per peer, then [`WaitSubDagFinish`] until every sub-DAG is parked on its
//! [`CheckDagStage`], then its critical section, then [`PassSubDags`] to
//! release them. A sub-DAG's `CheckDagStage` also completes on its own once
//! the main DAG reaches the expected stage.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::AgentAddr;
use crate::error::{Error, ErrorKind, Result};
use crate::task::{
    Executable, ExecutionEnv, GenericId, Operator, TaskError, TaskFlags, TaskResult, TaskState,
    TaskTemplate,
};

use super::client::{RpcClient, remote_code};
use super::executable::{
    DEFAULT_MAX_POLL_FAILURES, Opened, SubDagRequest, count_poll_failure, fetch_peer_dag,
    open_peer_dag, operate_peer_dag, trace_marker,
};
use super::paths;

/// Registered type of [`CreateSubDags`].
pub const CREATE_SUB_DAGS: &str = "CreateSubDags";
/// Registered type of [`CheckDagStage`].
pub const CHECK_DAG_STAGE: &str = "CheckDagStage";
/// Registered type of [`WaitSubDagFinish`].
pub const WAIT_SUB_DAG_FINISH: &str = "WaitSubDagFinish";
/// Registered type of [`PassSubDags`].
pub const PASS_SUB_DAGS: &str = "PassSubDags";

/// DAG data key: sub-DAGs opened by the main DAG.
pub const SUB_DAGS_KEY: &str = "sub_dags";
/// Task data key: stage to wait for.
pub const EXPECTED_STAGE_KEY: &str = "expected_stage";
/// Task data key: the [`SubDagRequest`] opened on every peer.
pub const SUB_DAG_KEY: &str = "sub_dag";
/// Task data key: peers receiving a sub-DAG.
pub const PEERS_KEY: &str = "peers";
/// Sub-DAG param: id of the main DAG.
pub const MAIN_DAG_ID_KEY: &str = "main_dag_id";
/// Sub-DAG param: agent holding the main DAG.
pub const MAIN_AGENT_KEY: &str = "main_agent";

const ROLLBACK_RETRIES_KEY: &str = "rollback_retries";
const POLL_FAILURES_KEY: &str = "poll_failures";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_ROLLBACK_RETRIES: u32 = 3;

/// A sub-DAG opened on a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDagRef {
    /// Peer holding the sub-DAG.
    pub agent: AgentAddr,
    /// Id of the sub-DAG on that peer.
    pub id: GenericId,
}

/// Template of a [`CreateSubDags`] task opening `request` on every peer.
pub fn create_sub_dags_task(request: &SubDagRequest, peers: &[AgentAddr]) -> Result<TaskTemplate> {
    TaskTemplate::new(CREATE_SUB_DAGS)
        .with_data(SUB_DAG_KEY, request)?
        .with_data(PEERS_KEY, peers)
}

/// Template of a [`CheckDagStage`] task parked until the main DAG reaches
/// `expected_stage`.
pub fn check_dag_stage_task(expected_stage: i32) -> Result<TaskTemplate> {
    TaskTemplate::new(CHECK_DAG_STAGE).with_data(EXPECTED_STAGE_KEY, expected_stage)
}

/// Template of a [`WaitSubDagFinish`] task. Without a stage it waits for
/// every sub-DAG to succeed.
pub fn wait_sub_dag_finish_task(expected_stage: Option<i32>) -> Result<TaskTemplate> {
    let task = TaskTemplate::new(WAIT_SUB_DAG_FINISH);
    match expected_stage {
        Some(stage) => task.with_data(EXPECTED_STAGE_KEY, stage),
        None => Ok(task),
    }
}

fn sub_dags(env: &ExecutionEnv) -> Result<Vec<SubDagRef>> {
    Ok(env.dag_data::<Vec<SubDagRef>>(SUB_DAGS_KEY)?.unwrap_or_default())
}

fn remote_failed(dag: &SubDagRef) -> TaskError {
    TaskError::Failed(Error::with_args(
        ErrorKind::TaskRemoteFailed,
        [dag.id.to_string(), dag.agent.to_string()],
    ))
}

/// Opens one sub-DAG per peer and records them in the DAG data.
#[derive(Debug, Clone)]
pub struct CreateSubDags {
    client: RpcClient,
    poll_interval: Duration,
}

impl CreateSubDags {
    /// Task using `client`.
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Delay between attempts on busy peers and rollback polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl Executable for CreateSubDags {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        let mut request: SubDagRequest = env
            .data(SUB_DAG_KEY)?
            .ok_or_else(|| Error::with_args(ErrorKind::TaskParamNotSet, [SUB_DAG_KEY]))?;
        let peers: Vec<AgentAddr> = env.data(PEERS_KEY)?.unwrap_or_default();
        request.context.set_param(MAIN_DAG_ID_KEY, env.dag_id())?;
        request.context.set_param(MAIN_AGENT_KEY, env.agent().addr())?;
        let marker = trace_marker(env);

        let mut opened = sub_dags(env)?;
        let mut busy = false;
        for peer in &peers {
            if opened.iter().any(|d| &d.agent == peer) {
                continue;
            }
            let body = serde_json::to_value(&request)?;
            match open_peer_dag(&self.client, peer, paths::SUB_DAG, body, &marker).await? {
                Opened::Created(id) | Opened::Adopted(id) => {
                    env.log(format!("opened sub dag {} on {}", id, peer));
                    opened.push(SubDagRef { agent: peer.clone(), id });
                }
                Opened::Busy(held) => {
                    env.log(format!("{} is busy with dag {}, waiting", peer, held));
                    busy = true;
                }
            }
        }
        env.set_dag_data(SUB_DAGS_KEY, &opened)?;
        if busy {
            return Err(TaskError::wait(self.poll_interval));
        }
        Ok(())
    }

    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        let mut retries: BTreeMap<String, u32> = env.data(ROLLBACK_RETRIES_KEY)?.unwrap_or_default();
        let mut pending = false;
        for dag in sub_dags(env)? {
            let detail = match fetch_peer_dag(&self.client, &dag.agent, dag.id).await {
                Ok(detail) => detail,
                Err(e) if remote_code(&e) == Some(ErrorKind::TaskNotFound.code()) => continue,
                Err(e) => return Err(e.into()),
            };
            let next = match (detail.operator, detail.state) {
                (Operator::Rollback, TaskState::Succeed) => None,
                (Operator::Rollback, TaskState::Failed) => {
                    let count = retries.entry(dag.agent.to_string()).or_insert(0);
                    *count += 1;
                    if *count > MAX_ROLLBACK_RETRIES {
                        return Err(remote_failed(&dag));
                    }
                    env.log(format!("rollback of sub dag {} on {} failed, retrying", dag.id, dag.agent));
                    Some(Operator::Rollback)
                }
                (Operator::Rollback, _) | (Operator::Cancel, TaskState::Running) => {
                    pending = true;
                    None
                }
                (_, TaskState::Failed | TaskState::Succeed) => Some(Operator::Rollback),
                _ => Some(Operator::Cancel),
            };
            if let Some(op) = next {
                operate_peer_dag(&self.client, &dag.agent, dag.id, op).await?;
                pending = true;
            }
        }
        env.set_data(ROLLBACK_RETRIES_KEY, &retries)?;
        if pending {
            return Err(TaskError::wait(self.poll_interval));
        }
        env.log("sub dags rolled back");
        Ok(())
    }

    fn additional_data(&self, env: &ExecutionEnv) -> Option<Value> {
        let opened = sub_dags(env).ok()?;
        (!opened.is_empty()).then(|| json!({ SUB_DAGS_KEY: opened }))
    }
}

/// Parks a sub-DAG until its main DAG reaches the expected stage.
///
/// Registered passable: a PASS from the main DAG releases it early.
#[derive(Debug, Clone)]
pub struct CheckDagStage {
    client: RpcClient,
    poll_interval: Duration,
    max_poll_failures: u32,
}

impl CheckDagStage {
    /// Task using `client`.
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
        }
    }

    /// Delay between polls of the main DAG.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Consecutive unreachable polls tolerated before failing.
    pub fn with_max_poll_failures(mut self, max: u32) -> Self {
        self.max_poll_failures = max;
        self
    }
}

#[async_trait]
impl Executable for CheckDagStage {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        let expected: i32 = env
            .data(EXPECTED_STAGE_KEY)?
            .ok_or_else(|| Error::with_args(ErrorKind::TaskParamNotSet, [EXPECTED_STAGE_KEY]))?;
        let main_id: GenericId = env.param(MAIN_DAG_ID_KEY)?;
        let main_agent: AgentAddr = env.param(MAIN_AGENT_KEY)?;

        let main = match fetch_peer_dag(&self.client, &main_agent, main_id).await {
            Ok(main) => {
                env.remove_data(POLL_FAILURES_KEY);
                main
            }
            Err(e) if e.kind() == ErrorKind::AgentRpcFailed => {
                count_poll_failure(env, POLL_FAILURES_KEY, &main_agent, self.max_poll_failures, e)?;
                return Err(TaskError::wait(self.poll_interval));
            }
            Err(e) => return Err(e.into()),
        };
        if matches!(main.operator, Operator::Cancel | Operator::Rollback) {
            env.log(format!("main dag {} is under {}", main_id, main.operator));
            return Err(TaskError::Failed(Error::with_args(
                ErrorKind::TaskRemoteFailed,
                [main_id.to_string(), main_agent.to_string()],
            )));
        }
        if main.stage >= expected || main.state == TaskState::Succeed {
            env.log(format!("main dag {} reached stage {}", main_id, main.stage));
            return Ok(());
        }
        Err(TaskError::wait(self.poll_interval))
    }
}

/// Waits until every sub-DAG reaches the expected stage, or succeeds when
/// no stage is given.
#[derive(Debug, Clone)]
pub struct WaitSubDagFinish {
    client: RpcClient,
    poll_interval: Duration,
    max_poll_failures: u32,
}

impl WaitSubDagFinish {
    /// Task using `client`.
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
        }
    }

    /// Delay between polls of the sub-DAGs.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Consecutive unreachable polls of one peer tolerated before failing.
    pub fn with_max_poll_failures(mut self, max: u32) -> Self {
        self.max_poll_failures = max;
        self
    }
}

#[async_trait]
impl Executable for WaitSubDagFinish {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        let expected: Option<i32> = env.data(EXPECTED_STAGE_KEY)?;
        let mut waiting = 0;
        for dag in sub_dags(env)? {
            env.check_cancelled()?;
            let failures_key = format!("{}/{}", POLL_FAILURES_KEY, dag.agent);
            let detail = match fetch_peer_dag(&self.client, &dag.agent, dag.id).await {
                Ok(detail) => {
                    env.remove_data(&failures_key);
                    detail
                }
                Err(e) if e.kind() == ErrorKind::AgentRpcFailed => {
                    count_poll_failure(env, &failures_key, &dag.agent, self.max_poll_failures, e)?;
                    waiting += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if detail.state == TaskState::Failed {
                env.log(format!("sub dag {} on {} failed", dag.id, dag.agent));
                return Err(remote_failed(&dag));
            }
            let reached = match expected {
                Some(stage) => detail.stage >= stage || detail.state == TaskState::Succeed,
                None => detail.state == TaskState::Succeed,
            };
            if !reached {
                waiting += 1;
            }
        }
        if waiting > 0 {
            return Err(TaskError::wait(self.poll_interval));
        }
        env.log("all sub dags reached the expected stage");
        Ok(())
    }
}

/// Releases every sub-DAG with PASS.
#[derive(Debug, Clone)]
pub struct PassSubDags {
    client: RpcClient,
}

impl PassSubDags {
    /// Task using `client`.
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Executable for PassSubDags {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        for dag in sub_dags(env)? {
            let detail = fetch_peer_dag(&self.client, &dag.agent, dag.id).await?;
            if detail.is_finished() && detail.state == TaskState::Succeed {
                continue;
            }
            if detail.operator == Operator::Pass {
                continue;
            }
            operate_peer_dag(&self.client, &dag.agent, dag.id, Operator::Pass).await?;
            env.log(format!("passed sub dag {} on {}", dag.id, dag.agent));
        }
        Ok(())
    }
}

/// Flags the rendezvous types are registered with.
pub fn rendezvous_flags(type_name: &str) -> TaskFlags {
    match type_name {
        CREATE_SUB_DAGS => TaskFlags::new().continuable().rollbackable(),
        CHECK_DAG_STAGE => TaskFlags::new().cancellable().continuable().passable(),
        _ => TaskFlags::new().cancellable().continuable(),
    }
}
