// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run a DAG on a peer and report it as a local sub-task.
//!
//! A [`RemoteSubDag`] never blocks a worker: every invocation performs one
//! step (create, poll, operate) and yields with [`TaskError::Wait`] until
//! the peer DAG is terminal. Progress lives in the sub-task data:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `target_agent` | peer to act on |
//! | `remote_uri` / `remote_body` | creation call, default `POST /rpc/v1/task/sub_dag` |
//! | `rollback_uri` / `rollback_body` | call replacing a rollback when the peer DAG is gone |
//! | `remote_id` | id of the peer DAG |
//! | `poll_failures` | consecutive unreachable polls |
//! | `mirrored_logs` | peer log lines already copied, per peer sub-task |

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::agent::AgentAddr;
use crate::error::{Error, ErrorKind, Result};
use crate::task::{
    DagDetail, DagOperatorRequest, Executable, ExecutionEnv, GenericId, Operator, TARGET_AGENT_KEY,
    TaskContext, TaskError, TaskResult, TaskState, Template,
};

use super::client::{RpcClient, remote_code};
use super::paths;

/// Registered type name.
pub const REMOTE_SUB_DAG: &str = "RemoteSubDag";

/// Data key: URI creating the peer DAG.
pub const REMOTE_URI_KEY: &str = "remote_uri";
/// Data key: body of the creation call.
pub const REMOTE_BODY_KEY: &str = "remote_body";
/// Data key: URI used when a rollback finds no peer DAG.
pub const ROLLBACK_URI_KEY: &str = "rollback_uri";
/// Data key: body of the rollback call.
pub const ROLLBACK_BODY_KEY: &str = "rollback_body";
/// Data key: id of the peer DAG.
pub const REMOTE_ID_KEY: &str = "remote_id";

const POLL_FAILURES_KEY: &str = "poll_failures";
const MIRRORED_LOGS_KEY: &str = "mirrored_logs";
const ATTEMPT_KEY: &str = "remote_attempt";
const ROLLBACK_RETRIES_KEY: &str = "rollback_retries";
const SYNTHETIC_ROLLBACK_KEY: &str = "synthetic_rollback";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_MAX_POLL_FAILURES: u32 = 10;
const MAX_ROLLBACK_RETRIES: u32 = 3;

/// Body of `POST /rpc/v1/task/sub_dag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagRequest {
    /// Plan to instantiate on the peer.
    pub template: Template,
    /// Context of the peer DAG.
    #[serde(default)]
    pub context: TaskContext,
    /// Marker linking the peer DAG to the creating sub-task.
    #[serde(default)]
    pub trace_id: String,
}

/// Generic remote executable.
#[derive(Debug, Clone)]
pub struct RemoteSubDag {
    client: RpcClient,
    poll_interval: Duration,
    max_poll_failures: u32,
}

impl RemoteSubDag {
    /// Driver using `client`.
    pub fn new(client: RpcClient) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
        }
    }

    /// Delay between polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Consecutive unreachable polls tolerated before failing.
    pub fn with_max_poll_failures(mut self, max: u32) -> Self {
        self.max_poll_failures = max;
        self
    }

    fn wait(&self) -> TaskResult {
        Err(TaskError::wait(self.poll_interval))
    }

    async fn fetch(&self, peer: &AgentAddr, id: GenericId) -> Result<DagDetail> {
        fetch_peer_dag(&self.client, peer, id).await
    }

    async fn operate(&self, peer: &AgentAddr, id: GenericId, operator: Operator) -> Result<()> {
        operate_peer_dag(&self.client, peer, id, operator).await
    }

    /// Poll the peer DAG. `Ok(None)` means the peer was unreachable but
    /// retries remain.
    async fn poll(
        &self,
        env: &mut ExecutionEnv,
        peer: &AgentAddr,
        id: GenericId,
    ) -> Result<Option<DagDetail>> {
        match self.fetch(peer, id).await {
            Ok(detail) => {
                env.remove_data(POLL_FAILURES_KEY);
                mirror_logs(env, peer, &detail)?;
                Ok(Some(detail))
            }
            Err(e) if e.kind() == ErrorKind::AgentRpcFailed => {
                count_poll_failure(env, POLL_FAILURES_KEY, peer, self.max_poll_failures, e)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create the peer DAG, or adopt one created by an earlier attempt.
    async fn create(&self, env: &mut ExecutionEnv, peer: &AgentAddr) -> Result<()> {
        let uri = env
            .data::<String>(REMOTE_URI_KEY)?
            .unwrap_or_else(|| paths::SUB_DAG.to_string());
        let body = env
            .data::<Value>(REMOTE_BODY_KEY)?
            .unwrap_or_else(|| json!({}));
        let id = match open_peer_dag(&self.client, peer, &uri, body, &trace_marker(env)).await? {
            Opened::Busy(held) => {
                env.log(format!("{} is busy with dag {}, waiting", peer, held));
                return Ok(());
            }
            Opened::Adopted(id) => {
                env.log(format!("adopted dag {} on {}", id, peer));
                id
            }
            Opened::Created(id) => {
                env.log(format!("created dag {} on {}", id, peer));
                id
            }
        };
        env.set_data(REMOTE_ID_KEY, id)?;
        env.set_data(ATTEMPT_KEY, env.execute_times())?;
        Ok(())
    }

    /// A local retry retries the failed peer DAG instead of creating a new
    /// one. Returns whether the caller should yield.
    async fn retry_if_new_attempt(
        &self,
        env: &mut ExecutionEnv,
        peer: &AgentAddr,
        id: GenericId,
    ) -> Result<bool> {
        let attempt = env.execute_times();
        if env.data::<i32>(ATTEMPT_KEY)?.unwrap_or(attempt) >= attempt {
            return Ok(false);
        }
        let fetched = self.fetch(peer, id).await;
        if fetched.is_ok() {
            env.remove_data(POLL_FAILURES_KEY);
        }
        match fetched {
            Ok(detail) if detail.state == TaskState::Failed => {
                self.operate(peer, id, Operator::Retry).await?;
                env.set_data(ATTEMPT_KEY, attempt)?;
                env.log(format!("retrying dag {} on {}", id, peer));
                Ok(true)
            }
            Ok(_) => {
                env.set_data(ATTEMPT_KEY, attempt)?;
                Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::AgentRpcFailed => {
                count_poll_failure(env, POLL_FAILURES_KEY, peer, self.max_poll_failures, e)?;
                Ok(true)
            }
            Err(e) if remote_code(&e) == Some(ErrorKind::TaskNotFound.code()) => {
                env.log(format!("dag {} is gone from {}, creating a new one", id, peer));
                env.remove_data(REMOTE_ID_KEY);
                env.remove_data(MIRRORED_LOGS_KEY);
                self.create(env, peer).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace a rollback of a vanished peer DAG by the configured call.
    async fn synthesize_rollback(&self, env: &mut ExecutionEnv, peer: &AgentAddr) -> TaskResult {
        let Some(uri) = env.data::<String>(ROLLBACK_URI_KEY)? else {
            env.log(format!("nothing to roll back on {}", peer));
            return Ok(());
        };
        let body = match env.data::<Value>(ROLLBACK_BODY_KEY)? {
            Some(body) => body,
            None => env.data::<Value>(REMOTE_BODY_KEY)?.unwrap_or_else(|| json!({})),
        };
        let created: DagDetail = self.client.post(peer, &uri, &body).await?.ok_or_else(|| {
            Error::with_args(ErrorKind::AgentRpcFailed, [peer.to_string(), "no dag returned".to_string()])
        })?;
        env.set_data(REMOTE_ID_KEY, created.id)?;
        env.set_data(SYNTHETIC_ROLLBACK_KEY, true)?;
        env.remove_data(MIRRORED_LOGS_KEY);
        env.log(format!("created rollback dag {} on {}", created.id, peer));
        self.wait()
    }

    fn finish(&self, detail: &DagDetail, peer: &AgentAddr) -> TaskResult {
        match detail.state {
            TaskState::Succeed => Ok(()),
            TaskState::Failed => Err(TaskError::Failed(Error::with_args(
                ErrorKind::TaskRemoteFailed,
                [detail.id.to_string(), peer.to_string()],
            ))),
            _ => self.wait(),
        }
    }
}

/// Count one unreachable poll of `peer` under `key`. Fails with `err` once
/// more than `max` polls in a row went unanswered; a successful poll must
/// remove `key`.
pub(crate) fn count_poll_failure(
    env: &mut ExecutionEnv,
    key: &str,
    peer: &AgentAddr,
    max: u32,
    err: Error,
) -> Result<()> {
    let failures = env.data::<u32>(key)?.unwrap_or(0) + 1;
    if failures > max {
        env.log(format!("lost connection to {}: {}", peer, err));
        return Err(err);
    }
    env.set_data(key, failures)?;
    debug!(peer = %peer, failures, "Peer unreachable while polling");
    Ok(())
}

/// Detail of DAG `id` on `peer`, including sub-task logs.
pub(crate) async fn fetch_peer_dag(client: &RpcClient, peer: &AgentAddr, id: GenericId) -> Result<DagDetail> {
    let uri = format!("{}?show_detail=true", paths::dag(id));
    client
        .get::<DagDetail>(peer, &uri)
        .await?
        .ok_or_else(|| Error::with_args(ErrorKind::TaskNotFound, [id]))
}

/// Apply `operator` to DAG `id` on `peer`.
pub(crate) async fn operate_peer_dag(
    client: &RpcClient,
    peer: &AgentAddr,
    id: GenericId,
    operator: Operator,
) -> Result<()> {
    client
        .post::<_, Value>(peer, &paths::dag(id), &DagOperatorRequest { operator })
        .await?;
    Ok(())
}

/// Result of [`open_peer_dag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opened {
    /// A new DAG was created.
    Created(GenericId),
    /// A DAG carrying our marker already existed.
    Adopted(GenericId),
    /// The peer holds an unrelated unfinished DAG.
    Busy(GenericId),
}

/// Marker tying a peer DAG to the sub-task that created it.
pub(crate) fn trace_marker(env: &ExecutionEnv) -> String {
    format!("{}/{}", env.dag_id(), env.task_id())
}

/// Create a DAG on `peer` unless the peer already holds one. A held DAG
/// carrying `marker` was created by an earlier attempt and is adopted.
pub(crate) async fn open_peer_dag(
    client: &RpcClient,
    peer: &AgentAddr,
    uri: &str,
    mut body: Value,
    marker: &str,
) -> Result<Opened> {
    let held: Option<DagDetail> = client.get(peer, paths::MAINTAIN_DAG).await?;
    if let Some(held) = held {
        if held.trace_id == marker {
            return Ok(Opened::Adopted(held.id));
        }
        if !held.is_finished() {
            return Ok(Opened::Busy(held.id));
        }
    }
    if let Value::Object(map) = &mut body {
        map.entry("trace_id")
            .or_insert_with(|| Value::from(marker));
    }
    let created: DagDetail = client.post(peer, uri, &body).await?.ok_or_else(|| {
        Error::with_args(ErrorKind::AgentRpcFailed, [peer.to_string(), "no dag returned".to_string()])
    })?;
    Ok(Opened::Created(created.id))
}

fn target(env: &ExecutionEnv) -> Result<AgentAddr> {
    env.data::<AgentAddr>(TARGET_AGENT_KEY)?
        .ok_or_else(|| Error::with_args(ErrorKind::TaskParamNotSet, [TARGET_AGENT_KEY]))
}

/// Copy peer log lines not seen yet, prefixed with the peer address.
fn mirror_logs(env: &mut ExecutionEnv, peer: &AgentAddr, detail: &DagDetail) -> Result<()> {
    let mut seen = env
        .data::<BTreeMap<String, usize>>(MIRRORED_LOGS_KEY)?
        .unwrap_or_default();
    let mut changed = false;
    for task in detail.nodes.iter().flat_map(|n| n.sub_tasks.iter()) {
        let count = seen.entry(task.id.to_string()).or_insert(0);
        for line in task.logs.iter().skip(*count) {
            env.log(format!("[{}] {}", peer, line));
        }
        if task.logs.len() > *count {
            *count = task.logs.len();
            changed = true;
        }
    }
    if changed {
        env.set_data(MIRRORED_LOGS_KEY, seen)?;
    }
    Ok(())
}

#[async_trait]
impl Executable for RemoteSubDag {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        let peer = target(env)?;
        let Some(id) = env.data::<GenericId>(REMOTE_ID_KEY)? else {
            self.create(env, &peer).await?;
            return self.wait();
        };
        if self.retry_if_new_attempt(env, &peer, id).await? {
            return self.wait();
        }
        let Some(id) = env.data::<GenericId>(REMOTE_ID_KEY)? else {
            return self.wait();
        };

        let Some(detail) = self.poll(env, &peer, id).await? else {
            return self.wait();
        };
        if detail.state == TaskState::Succeed {
            env.log(format!("dag {} on {} succeeded", id, peer));
        }
        self.finish(&detail, &peer)
    }

    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        let peer = target(env)?;
        let Some(id) = env.data::<GenericId>(REMOTE_ID_KEY)? else {
            return self.synthesize_rollback(env, &peer).await;
        };

        let detail = match self.poll(env, &peer, id).await {
            Ok(Some(detail)) => detail,
            Ok(None) => return self.wait(),
            Err(e) if remote_code(&e) == Some(ErrorKind::TaskNotFound.code()) => {
                env.log(format!("dag {} is gone from {}", id, peer));
                env.remove_data(REMOTE_ID_KEY);
                return self.synthesize_rollback(env, &peer).await;
            }
            Err(e) => return Err(e.into()),
        };

        if env.data::<bool>(SYNTHETIC_ROLLBACK_KEY)?.unwrap_or(false) {
            return self.finish(&detail, &peer);
        }

        match (detail.operator, detail.state) {
            (Operator::Rollback, TaskState::Succeed) => {
                env.log(format!("dag {} on {} rolled back", id, peer));
                Ok(())
            }
            (Operator::Rollback, TaskState::Failed) => {
                let retries = env.data::<u32>(ROLLBACK_RETRIES_KEY)?.unwrap_or(0) + 1;
                if retries > MAX_ROLLBACK_RETRIES {
                    return Err(TaskError::Failed(Error::with_args(
                        ErrorKind::TaskRemoteFailed,
                        [id.to_string(), peer.to_string()],
                    )));
                }
                env.set_data(ROLLBACK_RETRIES_KEY, retries)?;
                env.log(format!(
                    "rollback of dag {} on {} failed, retrying ({}/{})",
                    id, peer, retries, MAX_ROLLBACK_RETRIES
                ));
                self.operate(&peer, id, Operator::Rollback).await?;
                self.wait()
            }
            (Operator::Rollback, _) => self.wait(),
            (_, TaskState::Failed | TaskState::Succeed) => {
                env.log(format!("rolling back dag {} on {}", id, peer));
                self.operate(&peer, id, Operator::Rollback).await?;
                self.wait()
            }
            (Operator::Cancel, _) => self.wait(),
            _ => {
                env.log(format!("cancelling dag {} on {} before rollback", id, peer));
                self.operate(&peer, id, Operator::Cancel).await?;
                self.wait()
            }
        }
    }

    async fn on_cancel(&self, env: &mut ExecutionEnv) {
        let (Ok(peer), Ok(Some(id))) = (target(env), env.data::<GenericId>(REMOTE_ID_KEY)) else {
            env.log("cancelled before the peer dag was created");
            return;
        };
        match self.operate(&peer, id, Operator::Cancel).await {
            Ok(()) => env.log(format!("cancelled dag {} on {}", id, peer)),
            Err(e) => env.log(format!("failed to cancel dag {} on {}: {}", id, peer, e)),
        }
    }

    fn additional_data(&self, env: &ExecutionEnv) -> Option<Value> {
        let id = env.data::<GenericId>(REMOTE_ID_KEY).ok().flatten()?;
        let peer = target(env).ok()?;
        Some(json!({ "remote_id": id, "target_agent": peer.to_string() }))
    }
}
