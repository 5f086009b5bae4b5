// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The interface every registered sub-task type implements, and the
//! environment a worker hands to it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{AgentAddr, AgentIdentity};
use crate::error::{Error, Result};

use super::context::TaskContext;
use super::types::{GenericId, Operator};

/// Non-success outcome of a sub-task invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Not done yet; release the worker and invoke again after `after`.
    Wait {
        /// Delay before the next invocation.
        after: Duration,
    },
    /// Terminal failure.
    Failed(Error),
}

impl TaskError {
    /// Yield for `after`.
    pub fn wait(after: Duration) -> Self {
        Self::Wait { after }
    }
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.into())
    }
}

/// Result of one sub-task invocation.
pub type TaskResult = std::result::Result<(), TaskError>;

/// A registered sub-task type.
///
/// A fresh instance is created for every invocation; anything that must
/// survive a [`TaskError::Wait`] or a restart goes into the sub-task data
/// through [`ExecutionEnv::set_data`].
#[async_trait]
pub trait Executable: Send + Sync {
    /// Forward work.
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult;

    /// Undo [`Executable::execute`]. Types without `can_rollback` never get here.
    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        env.log("nothing to roll back");
        Ok(())
    }

    /// Called once when the cancel signal fires during a run.
    async fn on_cancel(&self, env: &mut ExecutionEnv) {
        env.log("cancelled");
    }

    /// Extra data exposed in the DAG detail, merged after every invocation.
    fn additional_data(&self, _env: &ExecutionEnv) -> Option<Value> {
        None
    }
}

/// What a sub-task sees while it runs.
#[derive(Debug)]
pub struct ExecutionEnv {
    task_id: GenericId,
    task_name: String,
    dag_id: GenericId,
    dag_name: String,
    stage: i32,
    dag_operator: Operator,
    execute_times: i32,
    agent: AgentIdentity,
    context: TaskContext,
    written: TaskContext,
    data: BTreeMap<String, Value>,
    additional_data: BTreeMap<String, Value>,
    logs: Vec<String>,
    cancel: CancellationToken,
}

/// Everything needed to build an [`ExecutionEnv`].
#[derive(Debug, Clone)]
pub struct EnvParts {
    /// Sub-task id.
    pub task_id: GenericId,
    /// Sub-task name.
    pub task_name: String,
    /// Owning DAG.
    pub dag_id: GenericId,
    /// DAG name.
    pub dag_name: String,
    /// Current DAG stage.
    pub stage: i32,
    /// DAG operator.
    pub dag_operator: Operator,
    /// Attempt counter.
    pub execute_times: i32,
    /// Executing agent.
    pub agent: AgentIdentity,
    /// DAG context.
    pub context: TaskContext,
    /// Sub-task data.
    pub data: BTreeMap<String, Value>,
    /// Additional data.
    pub additional_data: BTreeMap<String, Value>,
}

/// What an invocation produced.
#[derive(Debug, Clone, Default)]
pub struct EnvOutput {
    /// Context sections written by the task.
    pub written: TaskContext,
    /// Sub-task data after the run.
    pub data: BTreeMap<String, Value>,
    /// Additional data after the run.
    pub additional_data: BTreeMap<String, Value>,
    /// Log lines in append order.
    pub logs: Vec<String>,
}

impl ExecutionEnv {
    /// Build an environment with a fresh cancel signal.
    pub fn new(parts: EnvParts) -> Self {
        Self::with_cancel(parts, CancellationToken::new())
    }

    /// Build an environment bound to `cancel`.
    pub fn with_cancel(parts: EnvParts, cancel: CancellationToken) -> Self {
        Self {
            task_id: parts.task_id,
            task_name: parts.task_name,
            dag_id: parts.dag_id,
            dag_name: parts.dag_name,
            stage: parts.stage,
            dag_operator: parts.dag_operator,
            execute_times: parts.execute_times,
            agent: parts.agent,
            context: parts.context,
            written: TaskContext::default(),
            data: parts.data,
            additional_data: parts.additional_data,
            logs: Vec::new(),
            cancel,
        }
    }

    /// Sub-task id.
    pub fn task_id(&self) -> GenericId {
        self.task_id
    }

    /// Owning DAG id.
    pub fn dag_id(&self) -> GenericId {
        self.dag_id
    }

    /// DAG name.
    pub fn dag_name(&self) -> &str {
        &self.dag_name
    }

    /// Current DAG stage.
    pub fn stage(&self) -> i32 {
        self.stage
    }

    /// DAG operator at the time of the invocation.
    pub fn dag_operator(&self) -> Operator {
        self.dag_operator
    }

    /// Attempt counter, starting at 1.
    pub fn execute_times(&self) -> i32 {
        self.execute_times
    }

    /// The executing agent.
    pub fn agent(&self) -> &AgentIdentity {
        &self.agent
    }

    /// The DAG context as of the invocation.
    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    /// Required DAG parameter.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.context.param(key)
    }

    /// Optional DAG parameter.
    pub fn param_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.context.param_opt(key)
    }

    /// Sub-task data.
    pub fn data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.data
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| Error::illegal_argument(format!("task data '{}': {}", key, e)))
            })
            .transpose()
    }

    /// Write sub-task data.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Remove sub-task data.
    pub fn remove_data(&mut self, key: &str) {
        self.data.remove(key);
    }

    /// Shared DAG data, including writes of this invocation.
    pub fn dag_data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.written.data::<T>(key)? {
            Some(v) => Ok(Some(v)),
            None => self.context.data(key),
        }
    }

    /// Write shared DAG data.
    pub fn set_dag_data(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.written.set_data(key, value)
    }

    /// Data stored for `agent`.
    pub fn agent_data<T: DeserializeOwned>(&self, agent: &AgentAddr, key: &str) -> Result<Option<T>> {
        match self.written.agent_data::<T>(agent, key)? {
            Some(v) => Ok(Some(v)),
            None => self.context.agent_data(agent, key),
        }
    }

    /// Write data for `agent`.
    pub fn set_agent_data(
        &mut self,
        agent: &AgentAddr,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<()> {
        self.written.set_agent_data(agent, key, value)
    }

    /// Expose a value in the DAG detail.
    pub fn set_additional_data(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.additional_data
            .insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Append a line to the sub-task log.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(
            sub_task_id = %self.task_id,
            dag_id = %self.dag_id,
            execute_times = self.execute_times,
            task = %self.task_name,
            "{}",
            line
        );
        self.logs.push(line);
    }

    /// Whether the cancel signal fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with `TASK_CANCELLED` once the cancel signal fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::with_args(
                crate::error::ErrorKind::TaskCancelled,
                [&self.task_name],
            ));
        }
        Ok(())
    }

    /// The cancel signal.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Consume the environment.
    pub fn into_output(self) -> EnvOutput {
        EnvOutput {
            written: self.written,
            data: self.data,
            additional_data: self.additional_data,
            logs: self.logs,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn parts(context: TaskContext) -> EnvParts {
        EnvParts {
            task_id: GenericId::local(1),
            task_name: "test".to_string(),
            dag_id: GenericId::local(1),
            dag_name: "dag".to_string(),
            stage: 1,
            dag_operator: Operator::Run,
            execute_times: 1,
            agent: AgentIdentity::single("127.0.0.1", 2886, 2881),
            context,
            data: BTreeMap::new(),
            additional_data: BTreeMap::new(),
        }
    }

    #[test]
    fn test_dag_data_prefers_fresh_writes() {
        let mut ctx = TaskContext::new();
        ctx.set_data("k", 1).unwrap();
        let mut env = ExecutionEnv::new(parts(ctx));
        assert_eq!(env.dag_data::<i32>("k").unwrap(), Some(1));

        env.set_dag_data("k", 2).unwrap();
        assert_eq!(env.dag_data::<i32>("k").unwrap(), Some(2));

        env.set_data("own", "x").unwrap();
        env.log("line");
        let out = env.into_output();
        assert_eq!(out.written.data::<i32>("k").unwrap(), Some(2));
        assert_eq!(out.data["own"], Value::from("x"));
        assert_eq!(out.logs, vec!["line".to_string()]);
    }

    #[test]
    fn test_cancel_signal() {
        let token = CancellationToken::new();
        let env = ExecutionEnv::with_cancel(parts(TaskContext::new()), token.clone());
        assert!(env.check_cancelled().is_ok());
        token.cancel();
        assert!(env.is_cancelled());
        assert_eq!(
            env.check_cancelled().unwrap_err().kind(),
            crate::error::ErrorKind::TaskCancelled
        );
    }
}
