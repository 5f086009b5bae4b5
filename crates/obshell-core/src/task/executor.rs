// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor pool.
//!
//! A fixed number of workers drain a bounded waiting queue of sub-task keys.
//! A ready set deduplicates queued keys; a key dequeued while another worker
//! runs it goes to that worker's duplicate channel and is re-checked once the
//! current run ends, so no sub-task ever runs on two workers at once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentState;
use crate::error::{Error, ErrorKind, Result};
use crate::persistence::{Stores, SubTaskRecord, TaskStore};

use super::context::TaskContext;
use super::executable::{EnvParts, ExecutionEnv, TaskError};
use super::registry::TaskRegistry;
use super::types::{GenericId, Operator, StoreScope, TaskKey, TaskState};

const OPERATOR_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything workers and the scheduler share.
#[derive(Clone, Debug)]
pub struct EngineDeps {
    /// Local and cluster stores.
    pub stores: Stores,
    /// Registered task types.
    pub registry: Arc<TaskRegistry>,
    /// This agent.
    pub agent: AgentState,
    /// Wakes the scheduler after a sub-task transition.
    pub kick: Arc<Notify>,
    /// Serialises read-modify-write of DAG contexts.
    pub context_lock: Arc<tokio::sync::Mutex<()>>,
}

impl EngineDeps {
    /// Bundle engine dependencies.
    pub fn new(stores: Stores, registry: TaskRegistry, agent: AgentState) -> Self {
        Self {
            stores,
            registry: Arc::new(registry),
            agent,
            kick: Arc::new(Notify::new()),
            context_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Write a sub-task transition and its logs. Cluster transitions fall
    /// back to the local mirror when the cluster store rejects the write.
    pub async fn persist(&self, scope: StoreScope, task: &SubTaskRecord, logs: &[String]) -> Result<()> {
        match scope {
            StoreScope::Local => self.stores.tasks(scope).update_sub_task(task, logs).await,
            StoreScope::Cluster => {
                match self.stores.tasks(scope).update_sub_task(task, logs).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!(
                            sub_task_id = task.id,
                            error = %e,
                            "Cluster store unavailable, mirroring sub-task locally"
                        );
                        self.stores.local.save_mirror(task, logs).await
                    }
                }
            }
        }
    }
}

/// Executor pool configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of workers.
    pub worker_count: usize,
    /// Capacity of the waiting queue.
    pub waiting_queue_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            waiting_queue_size: 1024,
        }
    }
}

struct RunningEntry {
    cancel: CancellationToken,
    duplicates: mpsc::UnboundedSender<TaskKey>,
}

struct PoolInner {
    deps: EngineDeps,
    config: ExecutorConfig,
    tx: mpsc::Sender<TaskKey>,
    rx: tokio::sync::Mutex<mpsc::Receiver<TaskKey>>,
    ready: Mutex<HashSet<TaskKey>>,
    running: DashMap<TaskKey, RunningEntry>,
    shutdown: CancellationToken,
}

/// Pool of sub-task workers.
#[derive(Clone)]
pub struct ExecutorPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("config", &self.inner.config)
            .field("ready", &self.inner.ready.lock().len())
            .field("running", &self.inner.running.len())
            .finish()
    }
}

enum Interrupt {
    Timeout,
    Cancelled,
}

impl ExecutorPool {
    /// Create a pool; no worker runs until [`ExecutorPool::start`].
    pub fn new(deps: EngineDeps, config: ExecutorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.waiting_queue_size.max(1));
        Self {
            inner: Arc::new(PoolInner {
                deps,
                config,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                ready: Mutex::new(HashSet::new()),
                running: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the workers.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(
            worker_count = self.inner.config.worker_count,
            waiting_queue_size = self.inner.config.waiting_queue_size,
            "Executor pool started"
        );
        (0..self.inner.config.worker_count)
            .map(|worker| {
                let pool = self.clone();
                tokio::spawn(async move { pool.worker_loop(worker).await })
            })
            .collect()
    }

    /// Stop every worker after its current run.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Queue a sub-task. Already-queued keys are ignored.
    pub fn add_task(&self, key: TaskKey) -> Result<()> {
        if !self.inner.ready.lock().insert(key) {
            return Ok(());
        }
        match self.inner.tx.try_send(key) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.ready.lock().remove(&key);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(Error::new(ErrorKind::TaskQueueFull)),
                    mpsc::error::TrySendError::Closed(_) => {
                        Err(Error::unexpected("executor pool is stopped"))
                    }
                }
            }
        }
    }

    /// Fire the cancel signal of a running sub-task, or drop it from the
    /// queue when it has not started.
    pub fn cancel_task(&self, key: TaskKey) {
        if let Some(entry) = self.inner.running.get(&key) {
            info!(sub_task = %key, "Cancelling running sub-task");
            entry.cancel.cancel();
            return;
        }
        self.inner.ready.lock().remove(&key);
    }

    /// Whether `key` is queued.
    pub fn is_queued(&self, key: TaskKey) -> bool {
        self.inner.ready.lock().contains(&key)
    }

    /// Whether `key` is on a worker.
    pub fn is_running(&self, key: TaskKey) -> bool {
        self.inner.running.contains_key(&key)
    }

    /// Re-enqueue every unfinished sub-task assigned to this agent. RUNNING
    /// sub-tasks that cannot continue after a restart fail instead.
    pub async fn rehydrate(&self) -> Result<usize> {
        let me = self.inner.deps.agent.addr().to_string();
        let mut queued = 0;
        for scope in [StoreScope::Local, StoreScope::Cluster] {
            let store = self.inner.deps.stores.tasks(scope);
            let tasks = match store.list_runnable_sub_tasks(&me).await {
                Ok(tasks) => tasks,
                Err(e) if scope == StoreScope::Cluster => {
                    warn!(error = %e, "Cluster store unavailable, skipping cluster rehydration");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for mut task in tasks {
                let key = GenericId { scope, id: task.id };
                if task.state == TaskState::Running.as_str() && !task.can_continue {
                    task.state = TaskState::Failed.to_string();
                    task.end_at = Some(Utc::now());
                    let logs = ["agent restarted while the task was running".to_string()];
                    self.inner.deps.persist(scope, &task, &logs).await?;
                    warn!(sub_task = %key, "Failed interrupted sub-task");
                    continue;
                }
                self.add_task(key)?;
                queued += 1;
            }
        }
        info!(queued, "Executor pool rehydrated");
        self.inner.deps.kick.notify_one();
        Ok(queued)
    }

    async fn worker_loop(self, worker: usize) {
        let (dup_tx, mut dup_rx) = mpsc::unbounded_channel();
        loop {
            let key = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                key = async { self.inner.rx.lock().await.recv().await } => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            if !self.claim(key, &dup_tx) {
                continue;
            }
            self.run(worker, key).await;

            // Duplicates that arrived during the run; each is re-checked
            // against the store before running again.
            while let Ok(dup) = dup_rx.try_recv() {
                if self.claim_duplicate(dup, &dup_tx) {
                    self.run(worker, dup).await;
                }
            }
        }
        debug!(worker, "Executor worker stopped");
    }

    /// Move `key` from the ready set onto this worker, or hand it to the
    /// worker already running it.
    fn claim(&self, key: TaskKey, dup_tx: &mpsc::UnboundedSender<TaskKey>) -> bool {
        let mut ready = self.inner.ready.lock();
        if !ready.remove(&key) {
            return false;
        }
        self.register(key, dup_tx)
    }

    fn claim_duplicate(&self, key: TaskKey, dup_tx: &mpsc::UnboundedSender<TaskKey>) -> bool {
        let _ready = self.inner.ready.lock();
        self.register(key, dup_tx)
    }

    fn register(&self, key: TaskKey, dup_tx: &mpsc::UnboundedSender<TaskKey>) -> bool {
        match self.inner.running.entry(key) {
            Entry::Occupied(entry) => {
                let _ = entry.get().duplicates.send(key);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(RunningEntry {
                    cancel: CancellationToken::new(),
                    duplicates: dup_tx.clone(),
                });
                true
            }
        }
    }

    async fn run(&self, worker: usize, key: TaskKey) {
        let cancel = match self.inner.running.get(&key) {
            Some(entry) => entry.cancel.clone(),
            None => CancellationToken::new(),
        };
        if let Err(e) = self.execute(key, cancel).await {
            error!(worker, sub_task = %key, error = %e, "Sub-task execution failed");
        }
        self.inner.running.remove(&key);
        self.inner.deps.kick.notify_one();
    }

    async fn execute(&self, key: TaskKey, cancel: CancellationToken) -> Result<()> {
        let deps = &self.inner.deps;
        let store = deps.stores.tasks(key.scope).clone();
        let Some(mut task) = store.get_sub_task(key.id).await? else {
            warn!(sub_task = %key, "Sub-task no longer exists");
            return Ok(());
        };
        let me = deps.agent.addr().to_string();
        if task.execute_agent != me {
            debug!(sub_task = %key, agent = %task.execute_agent, "Sub-task belongs to another agent");
            return Ok(());
        }
        let state = task.task_state()?;
        if !matches!(state, TaskState::Ready | TaskState::Running) {
            return Ok(());
        }
        let dag = store
            .get_dag(task.dag_id)
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::TaskNotFound, [task.dag_id]))?;
        let dag_operator = dag.task_operator()?;
        let task_operator = task.task_operator()?;
        let flags = task.flags();
        let now = Utc::now();

        if dag_operator == Operator::Pass && flags.can_pass && task_operator != Operator::Rollback {
            task.state = TaskState::Succeed.to_string();
            task.operator = Operator::Pass.to_string();
            task.started_at.get_or_insert(now);
            task.end_at = Some(now);
            deps.persist(key.scope, &task, &["passed by operator".to_string()])
                .await?;
            info!(sub_task = %key, "Sub-task passed by operator");
            return Ok(());
        }
        if dag_operator == Operator::Cancel && flags.can_cancel {
            task.state = TaskState::Failed.to_string();
            task.operator = Operator::Cancel.to_string();
            task.end_at = Some(now);
            deps.persist(key.scope, &task, &["cancelled by operator".to_string()])
                .await?;
            info!(sub_task = %key, "Sub-task cancelled by operator");
            return Ok(());
        }

        if state == TaskState::Ready {
            task.state = TaskState::Running.to_string();
            task.started_at = Some(now);
            task.end_at = None;
            deps.persist(key.scope, &task, &[]).await?;
        }

        let context: TaskContext = serde_json::from_str(&dag.context)?;
        let timeout_secs = context.timeout_secs();
        let elapsed = task
            .started_at
            .map(|s| (now - s).to_std().unwrap_or_default())
            .unwrap_or_default();
        let remaining = Duration::from_secs(timeout_secs).saturating_sub(elapsed);

        let parts = EnvParts {
            task_id: key,
            task_name: task.name.clone(),
            dag_id: GenericId {
                scope: key.scope,
                id: dag.id,
            },
            dag_name: dag.name.clone(),
            stage: dag.stage,
            dag_operator,
            execute_times: task.execute_times,
            agent: deps.agent.get(),
            context,
            data: json_map(&task.data)?,
            additional_data: json_map(&task.additional_data)?,
        };
        let mut env = ExecutionEnv::with_cancel(parts, cancel.clone());

        let outcome = match deps.registry.create(&task.type_name) {
            Err(e) => Err(TaskError::Failed(e)),
            Ok(executable) => {
                let rollback = task_operator == Operator::Rollback;
                let interrupted = {
                    let run = async {
                        if rollback {
                            executable.rollback(&mut env).await
                        } else {
                            executable.execute(&mut env).await
                        }
                    };
                    let watch = async {
                        if !flags.can_cancel {
                            return std::future::pending::<()>().await;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = watch_cancel_operator(store.as_ref(), dag.id) => {}
                        }
                    };
                    tokio::select! {
                        r = run => Ok(r),
                        _ = tokio::time::sleep(remaining) => Err(Interrupt::Timeout),
                        _ = watch => Err(Interrupt::Cancelled),
                    }
                };
                let outcome = match interrupted {
                    Ok(r) => r,
                    Err(Interrupt::Timeout) => Err(TaskError::Failed(Error::with_args(
                        ErrorKind::TaskTimeout,
                        [task.name.clone(), timeout_secs.to_string()],
                    ))),
                    Err(Interrupt::Cancelled) => {
                        cancel.cancel();
                        executable.on_cancel(&mut env).await;
                        Err(TaskError::Failed(Error::with_args(
                            ErrorKind::TaskCancelled,
                            [&task.name],
                        )))
                    }
                };
                if let Some(Value::Object(extra)) = executable.additional_data(&env) {
                    for (k, v) in extra {
                        env.set_additional_data(k, v)?;
                    }
                }
                outcome
            }
        };

        let output = env.into_output();
        let mut logs = output.logs;
        let mut wait = None;
        let end = Utc::now();
        match outcome {
            Ok(()) => {
                task.state = TaskState::Succeed.to_string();
                task.end_at = Some(end);
            }
            Err(TaskError::Wait { after }) => wait = Some(after),
            Err(TaskError::Failed(e)) => {
                warn!(sub_task = %key, code = e.code(), error = %e, "Sub-task failed");
                logs.push(e.to_string());
                task.state = TaskState::Failed.to_string();
                task.end_at = Some(end);
            }
        }
        task.data = serde_json::to_string(&output.data)?;
        task.additional_data = serde_json::to_string(&output.additional_data)?;

        if !output.written.data.is_empty() || !output.written.agent_data.is_empty() {
            let _guard = deps.context_lock.lock().await;
            if let Some(fresh) = store.get_dag(dag.id).await? {
                let mut ctx: TaskContext = serde_json::from_str(&fresh.context)?;
                ctx.merge_written(&output.written);
                store
                    .update_dag_context(dag.id, &serde_json::to_string(&ctx)?)
                    .await?;
            }
        }

        deps.persist(key.scope, &task, &logs).await?;
        debug!(sub_task = %key, state = %task.state, "Sub-task invocation finished");

        if let Some(after) = wait {
            self.requeue_after(key, after);
        }
        Ok(())
    }

    /// Re-enqueue a yielded sub-task once `after` has elapsed.
    fn requeue_after(&self, key: TaskKey, after: Duration) {
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(after) => {}
                }
                match pool.add_task(key) {
                    Err(e) if e.kind() == ErrorKind::TaskQueueFull => {
                        warn!(sub_task = %key, "Waiting queue full, retrying re-enqueue");
                    }
                    Err(e) => {
                        error!(sub_task = %key, error = %e, "Failed to re-enqueue sub-task");
                        return;
                    }
                    Ok(()) => return,
                }
            }
        });
    }
}

/// Resolves once the DAG operator becomes CANCEL.
async fn watch_cancel_operator(store: &dyn TaskStore, dag_id: i64) {
    loop {
        tokio::time::sleep(OPERATOR_POLL_INTERVAL).await;
        match store.get_dag(dag_id).await {
            Ok(Some(dag)) if dag.operator == Operator::Cancel.as_str() => return,
            Ok(_) => {}
            Err(e) => debug!(dag_id, error = %e, "Operator watch poll failed"),
        }
    }
}

fn json_map(raw: &str) -> Result<BTreeMap<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentIdentity;
    use crate::persistence::SqlitePersistence;

    async fn test_pool(queue: usize) -> ExecutorPool {
        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let cluster = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let stores = Stores::sqlite(local.clone(), cluster);
        let agent = AgentState::new(AgentIdentity::single("127.0.0.1", 2886, 2881), local);
        let deps = EngineDeps::new(stores, TaskRegistry::new(), agent);
        ExecutorPool::new(
            deps,
            ExecutorConfig {
                worker_count: 1,
                waiting_queue_size: queue,
            },
        )
    }

    #[tokio::test]
    async fn test_add_task_deduplicates() {
        let pool = test_pool(4).await;
        let key = GenericId::local(1);

        pool.add_task(key).unwrap();
        pool.add_task(key).unwrap();
        assert!(pool.is_queued(key));
        assert_eq!(pool.inner.tx.capacity(), 3);
    }

    #[tokio::test]
    async fn test_add_task_reports_full_queue() {
        let pool = test_pool(1).await;

        pool.add_task(GenericId::local(1)).unwrap();
        let err = pool.add_task(GenericId::local(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskQueueFull);
        assert!(!pool.is_queued(GenericId::local(2)));
    }

    #[tokio::test]
    async fn test_cancel_unstarted_task_drops_it() {
        let pool = test_pool(4).await;
        let key = GenericId::cluster(9);

        pool.add_task(key).unwrap();
        pool.cancel_task(key);
        assert!(!pool.is_queued(key));

        // The stale queue entry is skipped by the worker.
        let (dup_tx, _dup_rx) = mpsc::unbounded_channel();
        assert!(!pool.claim(key, &dup_tx));
    }

    #[tokio::test]
    async fn test_duplicate_goes_to_running_worker() {
        let pool = test_pool(4).await;
        let key = GenericId::local(5);
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, _second_rx) = mpsc::unbounded_channel();

        pool.add_task(key).unwrap();
        assert!(pool.claim(key, &first_tx));
        assert!(pool.is_running(key));

        pool.add_task(key).unwrap();
        assert!(!pool.claim(key, &second_tx));
        assert_eq!(first_rx.try_recv().unwrap(), key);
    }
}
