// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Public operations of the DAG engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::agent::{AgentAddr, AgentStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::persistence::{CreateOutcome, DagRecord, NewDag, NewNode, NewSubTask};

use super::context::TaskContext;
use super::executor::{EngineDeps, ExecutorPool};
use super::state::{self, DagSnapshot, Step};
use super::template::Template;
use super::types::{GenericId, MaintenanceScope, Operator, StoreScope, TaskState};

const CREATE_ATTEMPTS: usize = 3;

/// DAG as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDetail {
    /// Store-qualified id.
    pub id: GenericId,
    /// Human name.
    pub name: String,
    /// 1-based current node.
    pub stage: i32,
    /// Number of nodes.
    pub max_stage: i32,
    /// State.
    pub state: TaskState,
    /// Operator.
    pub operator: Operator,
    /// Maintenance scope.
    pub maintenance_scope: MaintenanceScope,
    /// Trace id of the creating request.
    #[serde(default)]
    pub trace_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First scheduling time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub end_at: Option<DateTime<Utc>>,
    /// Nodes, when detail was requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDetail>,
}

impl DagDetail {
    /// SUCCEED or FAILED.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Node as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    /// Node name.
    pub name: String,
    /// Whether sub-tasks run concurrently.
    pub parallel: bool,
    /// State.
    pub state: TaskState,
    /// Operator.
    pub operator: Operator,
    /// First scheduling time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub end_at: Option<DateTime<Utc>>,
    /// Sub-tasks in declared order.
    pub sub_tasks: Vec<SubTaskDetail>,
}

/// Sub-task as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskDetail {
    /// Store-qualified id.
    pub id: GenericId,
    /// Registered type.
    pub type_name: String,
    /// Display name.
    pub name: String,
    /// State.
    pub state: TaskState,
    /// Operator.
    pub operator: Operator,
    /// Attempt counter.
    pub execute_times: i32,
    /// Executing agent.
    pub execute_agent: String,
    /// Data the task chose to expose.
    #[serde(default)]
    pub additional_data: Value,
    /// Start of the current attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time of the current attempt.
    pub end_at: Option<DateTime<Utc>>,
    /// Log lines ordered by attempt then append order.
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Body of `POST /api/v1/task/dag/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagOperatorRequest {
    /// Operator to apply.
    pub operator: Operator,
}

/// Entry point of the DAG engine.
#[derive(Clone, Debug)]
pub struct TaskService {
    deps: EngineDeps,
    pool: ExecutorPool,
    dag_lock: Arc<tokio::sync::Mutex<()>>,
}

impl TaskService {
    /// Service over `deps`, feeding `pool`.
    pub fn new(deps: EngineDeps, pool: ExecutorPool) -> Self {
        Self {
            deps,
            pool,
            dag_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Shared engine dependencies.
    pub fn deps(&self) -> &EngineDeps {
        &self.deps
    }

    /// The executor pool.
    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    /// Persist a new DAG built from `template`.
    ///
    /// FAILED DAGs among `force_pass` are moved to SUCCEED with operator
    /// PASS first; ids of another store, missing ids and DAGs in any other
    /// state are ignored.
    #[instrument(skip(self, template, context, force_pass), fields(dag = %template.name, scope = %template.scope))]
    pub async fn create_dag_by_template(
        &self,
        template: &Template,
        context: &TaskContext,
        force_pass: &[GenericId],
        trace_id: &str,
    ) -> Result<DagDetail> {
        template.validate()?;
        self.check_targets(template).await?;
        let me = self.deps.agent.addr().to_string();

        let mut nodes = Vec::with_capacity(template.nodes.len());
        for node in &template.nodes {
            let mut tasks = Vec::with_capacity(node.tasks.len());
            for task in &node.tasks {
                let flags = match task.flags {
                    Some(flags) => {
                        self.deps.registry.flags(&task.type_name)?;
                        flags
                    }
                    None => self.deps.registry.flags(&task.type_name)?,
                };
                tasks.push(NewSubTask {
                    type_name: task.type_name.clone(),
                    name: task.name.clone(),
                    flags,
                    execute_agent: task
                        .agent
                        .as_ref()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| me.clone()),
                    data: serde_json::to_string(&task.data)?,
                });
            }
            nodes.push(NewNode {
                name: node.name.clone(),
                parallel: node.parallel,
                tasks,
            });
        }

        let dag = NewDag {
            name: template.name.clone(),
            maintenance_type: template.scope.type_str().to_string(),
            maintenance_key: template.scope.key().to_string(),
            context: serde_json::to_string(context)?,
            trace_id: trace_id.to_string(),
            nodes,
        };
        let force_pass: Vec<i64> = force_pass
            .iter()
            .filter(|id| id.scope == template.store)
            .map(|id| id.id)
            .collect();

        let store = self.deps.stores.tasks(template.store);
        for attempt in 1..=CREATE_ATTEMPTS {
            match store.create_dag(&dag, &force_pass).await? {
                CreateOutcome::Created(record) => {
                    let id = GenericId {
                        scope: template.store,
                        id: record.id,
                    };
                    info!(dag_id = %id, "DAG created");
                    self.deps.kick.notify_one();
                    return self.to_detail(template.store, record, false).await;
                }
                CreateOutcome::Conflict { holder } => {
                    let holder = GenericId {
                        scope: template.store,
                        id: holder,
                    };
                    return Err(Error::with_args(
                        ErrorKind::TaskMaintenanceConflict,
                        [template.scope.to_string(), holder.to_string()],
                    ));
                }
                CreateOutcome::RaceLost => {
                    warn!(attempt, "Lost maintenance scope race, retrying");
                }
            }
        }
        Err(Error::with_args(
            ErrorKind::TaskMaintenanceConflict,
            [template.scope.to_string(), "concurrent creation".to_string()],
        ))
    }

    /// Every agent a template names, other than this one, must be a
    /// registered member.
    async fn check_targets(&self, template: &Template) -> Result<()> {
        let me = self.deps.agent.addr();
        for target in template.targets()? {
            if target == me {
                continue;
            }
            let member = self
                .deps
                .stores
                .cluster
                .get_agent(&target.ip, target.port)
                .await?;
            if member.is_none() {
                return Err(Error::with_args(
                    ErrorKind::ObClusterScopeInvalid,
                    [format!("agent {} is not a member", target)],
                ));
            }
        }
        Ok(())
    }

    /// Apply an operator to a DAG and advance it.
    #[instrument(skip_all, fields(dag_id = %id, op = %op))]
    pub async fn operate(&self, id: GenericId, op: Operator) -> Result<DagDetail> {
        let _guard = self.dag_lock.lock().await;
        let mut snapshot = self.snapshot(id).await?;

        if op == Operator::Retry && id.scope == StoreScope::Cluster {
            self.reassign_orphans(&mut snapshot).await?;
        }

        let step = state::apply_operator(&snapshot, op, Utc::now())?;
        self.apply_step(&snapshot, step).await?;
        info!("Operator applied");

        self.advance_locked(id).await?;
        self.get_dag(id, false).await
    }

    /// Failed sub-tasks of agents that are gone or inactive retry here.
    async fn reassign_orphans(&self, snapshot: &mut DagSnapshot) -> Result<()> {
        let me = self.deps.agent.addr().to_string();
        for task in &mut snapshot.tasks {
            if task.state != TaskState::Failed.as_str() || task.execute_agent == me {
                continue;
            }
            let addr: AgentAddr = task.execute_agent.parse()?;
            let alive = self
                .deps
                .stores
                .cluster
                .get_agent(&addr.ip, addr.port)
                .await?
                .map(|a| a.agent_status() == AgentStatus::Active)
                .unwrap_or(false);
            if !alive {
                warn!(sub_task_id = task.id, from = %addr, "Reassigning failed sub-task to self");
                task.execute_agent = me.clone();
            }
        }
        Ok(())
    }

    /// Snapshot of a DAG.
    #[instrument(skip_all, fields(dag_id = %id))]
    pub async fn get_dag(&self, id: GenericId, show_detail: bool) -> Result<DagDetail> {
        let dag = self
            .deps
            .stores
            .tasks(id.scope)
            .get_dag(id.id)
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::TaskNotFound, [id]))?;
        self.to_detail(id.scope, dag, show_detail).await
    }

    /// Newest DAG of either store holding a scope intersecting `scope`.
    pub async fn get_maintenance_dag(&self, scope: &MaintenanceScope) -> Result<Option<DagDetail>> {
        let mut newest: Option<(StoreScope, DagRecord)> = None;
        for store_scope in [StoreScope::Local, StoreScope::Cluster] {
            let holders = match self.deps.stores.tasks(store_scope).list_maintenance_holders().await {
                Ok(holders) => holders,
                Err(e) if store_scope == StoreScope::Cluster => {
                    warn!(error = %e, "Cluster store unavailable, skipping cluster holders");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for dag in holders {
                let held = MaintenanceScope::from_columns(&dag.maintenance_type, &dag.maintenance_key)?;
                if !held.intersects(scope) {
                    continue;
                }
                let newer = newest
                    .as_ref()
                    .map(|(_, current)| dag.created_at > current.created_at)
                    .unwrap_or(true);
                if newer {
                    newest = Some((store_scope, dag));
                }
            }
        }
        match newest {
            Some((store_scope, dag)) => Ok(Some(self.to_detail(store_scope, dag, false).await?)),
            None => Ok(None),
        }
    }

    /// Move a live DAG as far as its sub-task states allow.
    pub async fn advance_dag(&self, id: GenericId) -> Result<()> {
        let _guard = self.dag_lock.lock().await;
        self.advance_locked(id).await
    }

    async fn advance_locked(&self, id: GenericId) -> Result<()> {
        let snapshot = self.snapshot(id).await?;
        let step = state::advance(&snapshot, Utc::now())?;
        if !step.is_empty() {
            self.apply_step(&snapshot, step).await?;
        }
        Ok(())
    }

    async fn snapshot(&self, id: GenericId) -> Result<DagSnapshot> {
        let store = self.deps.stores.tasks(id.scope);
        let dag = store
            .get_dag(id.id)
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::TaskNotFound, [id]))?;
        let nodes = store.list_nodes(dag.id).await?;
        let tasks = store.list_sub_tasks(dag.id).await?;
        Ok(DagSnapshot {
            scope: id.scope,
            dag,
            nodes,
            tasks,
        })
    }

    async fn apply_step(&self, snapshot: &DagSnapshot, step: Step) -> Result<()> {
        let scope = snapshot.scope;
        let store = self.deps.stores.tasks(scope);
        for task in &step.tasks {
            store.update_sub_task(task, &[]).await?;
        }
        for node in &step.nodes {
            store.update_node(node).await?;
        }
        if let Some(dag) = &step.dag {
            store.update_dag(dag).await?;
            if dag.state != snapshot.dag.state {
                info!(
                    dag_id = %snapshot.generic_id(),
                    from = %snapshot.dag.state,
                    to = %dag.state,
                    stage = dag.stage,
                    "DAG state changed"
                );
            }
        }

        for id in step.cancel {
            self.pool.cancel_task(GenericId { scope, id });
        }
        let me = self.deps.agent.addr().to_string();
        for id in step.enqueue {
            let mine = step
                .tasks
                .iter()
                .chain(snapshot.tasks.iter())
                .find(|t| t.id == id)
                .map(|t| t.execute_agent == me)
                .unwrap_or(false);
            if !mine {
                continue;
            }
            if let Err(e) = self.pool.add_task(GenericId { scope, id }) {
                // READY sub-tasks are re-offered on every scheduler tick.
                warn!(sub_task_id = id, error = %e, "Could not enqueue sub-task");
            }
        }
        Ok(())
    }

    async fn to_detail(&self, scope: StoreScope, dag: DagRecord, show_detail: bool) -> Result<DagDetail> {
        let mut detail = DagDetail {
            id: GenericId { scope, id: dag.id },
            name: dag.name.clone(),
            stage: dag.stage,
            max_stage: dag.max_stage,
            state: dag.task_state()?,
            operator: dag.task_operator()?,
            maintenance_scope: MaintenanceScope::from_columns(
                &dag.maintenance_type,
                &dag.maintenance_key,
            )?,
            trace_id: dag.trace_id.clone(),
            created_at: dag.created_at,
            started_at: dag.started_at,
            end_at: dag.end_at,
            nodes: Vec::new(),
        };
        if !show_detail {
            return Ok(detail);
        }

        let store = self.deps.stores.tasks(scope);
        let tasks = store.list_sub_tasks(dag.id).await?;
        for node in store.list_nodes(dag.id).await? {
            let mut sub_tasks = Vec::new();
            for task in tasks.iter().filter(|t| t.node_id == node.id) {
                let logs = store
                    .list_logs(task.id)
                    .await?
                    .into_iter()
                    .map(|l| l.content)
                    .collect();
                sub_tasks.push(SubTaskDetail {
                    id: GenericId { scope, id: task.id },
                    type_name: task.type_name.clone(),
                    name: task.name.clone(),
                    state: task.task_state()?,
                    operator: task.task_operator()?,
                    execute_times: task.execute_times,
                    execute_agent: task.execute_agent.clone(),
                    additional_data: serde_json::from_str(&task.additional_data)
                        .unwrap_or(Value::Null),
                    started_at: task.started_at,
                    end_at: task.end_at,
                    logs,
                });
            }
            detail.nodes.push(NodeDetail {
                name: node.name.clone(),
                parallel: node.parallel,
                state: node.task_state()?,
                operator: node.task_operator()?,
                started_at: node.started_at,
                end_at: node.end_at,
                sub_tasks,
            });
        }
        Ok(detail)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::{AgentIdentity, AgentState};
    use crate::persistence::{SqlitePersistence, Stores};
    use crate::task::executable::{Executable, ExecutionEnv, TaskError, TaskResult};
    use crate::task::executor::ExecutorConfig;
    use crate::task::registry::TaskRegistry;
    use crate::task::template::{NodeTemplate, TaskTemplate};
    use crate::task::types::TaskFlags;

    struct Succeed;

    #[async_trait::async_trait]
    impl Executable for Succeed {
        async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
            env.log("done");
            env.set_dag_data("touched", true)?;
            Ok(())
        }
    }

    struct Fail;

    #[async_trait::async_trait]
    impl Executable for Fail {
        async fn execute(&self, _env: &mut ExecutionEnv) -> TaskResult {
            Err(TaskError::Failed(Error::unexpected("boom")))
        }
    }

    pub(crate) async fn test_service(registry: TaskRegistry) -> TaskService {
        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let cluster = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let stores = Stores::sqlite(local.clone(), cluster);
        let agent = AgentState::new(AgentIdentity::single("127.0.0.1", 2886, 2881), local);
        let deps = EngineDeps::new(stores, registry, agent);
        let pool = ExecutorPool::new(deps.clone(), ExecutorConfig::default());
        TaskService::new(deps, pool)
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("Succeed", TaskFlags::new().rollbackable(), || Succeed);
        registry.register("Fail", TaskFlags::new().passable(), || Fail);
        registry
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_type_and_conflicts() {
        let service = test_service(registry()).await;
        let ctx = TaskContext::new();

        let unknown = Template::builder("unknown")
            .node(NodeTemplate::single("Missing"))
            .build()
            .unwrap();
        let err = service
            .create_dag_by_template(&unknown, &ctx, &[], "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskTypeNotRegistered);

        let global = Template::builder("global")
            .scope(MaintenanceScope::Global)
            .node(NodeTemplate::single("Succeed"))
            .build()
            .unwrap();
        let first = service
            .create_dag_by_template(&global, &ctx, &[], "trace-1")
            .await
            .unwrap();
        assert_eq!(first.state, TaskState::Ready);
        assert_eq!(first.trace_id, "trace-1");

        let tenant = Template::builder("tenant")
            .scope(MaintenanceScope::Tenant("t1".into()))
            .node(NodeTemplate::single("Succeed"))
            .build()
            .unwrap();
        let err = service
            .create_dag_by_template(&tenant, &ctx, &[], "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskMaintenanceConflict);
        assert_eq!(err.args()[1], first.id.to_string());

        let holder = service
            .get_maintenance_dag(&MaintenanceScope::Tenant("t1".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.id, first.id);
    }

    #[tokio::test]
    async fn test_create_rejects_agents_outside_the_cluster() {
        let service = test_service(registry()).await;
        let ctx = TaskContext::new();
        let stranger = AgentAddr::new("10.9.9.9", 2886);

        let direct = Template::builder("direct")
            .scope(MaintenanceScope::Global)
            .cluster()
            .node(NodeTemplate::new("n").task(TaskTemplate::new("Succeed").on(stranger.clone())))
            .build()
            .unwrap();
        let err = service
            .create_dag_by_template(&direct, &ctx, &[], "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObClusterScopeInvalid);
        assert_eq!(err.args()[0], "agent 10.9.9.9:2886 is not a member");

        let remote = Template::builder("remote")
            .cluster()
            .node(NodeTemplate::remote_on("Succeed", &[stranger.clone()]).unwrap())
            .build()
            .unwrap();
        let err = service
            .create_dag_by_template(&remote, &ctx, &[], "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObClusterScopeInvalid);
        assert!(service.get_maintenance_dag(&MaintenanceScope::Global).await.unwrap().is_none());

        // this agent needs no registration
        let own = Template::builder("own")
            .node(NodeTemplate::new("n").task(TaskTemplate::new("Succeed").on(service.deps().agent.addr())))
            .build()
            .unwrap();
        service.create_dag_by_template(&own, &ctx, &[], "").await.unwrap();

        let member = AgentIdentity::single("10.9.9.9", 2886, 2881);
        service
            .deps()
            .stores
            .cluster
            .insert_agent(&member, AgentStatus::Active, "t")
            .await
            .unwrap();
        service.create_dag_by_template(&direct, &ctx, &[], "").await.unwrap();
        service.create_dag_by_template(&remote, &ctx, &[], "").await.unwrap();
    }

    #[tokio::test]
    async fn test_dag_runs_to_success_through_workers() {
        let service = test_service(registry()).await;
        let _workers = service.pool().start();
        let template = Template::builder("two nodes")
            .node(NodeTemplate::single("Succeed"))
            .node(NodeTemplate::single("Succeed"))
            .build()
            .unwrap();
        let dag = service
            .create_dag_by_template(&template, &TaskContext::new(), &[], "")
            .await
            .unwrap();

        let detail = drive(&service, dag.id).await;
        assert_eq!(detail.state, TaskState::Succeed);
        assert_eq!(detail.stage, 2);
        assert_eq!(detail.nodes[0].sub_tasks[0].logs, vec!["done".to_string()]);

        let record = service
            .deps()
            .stores
            .tasks(StoreScope::Local)
            .get_dag(dag.id.id)
            .await
            .unwrap()
            .unwrap();
        let ctx: TaskContext = serde_json::from_str(&record.context).unwrap();
        assert_eq!(ctx.data::<bool>("touched").unwrap(), Some(true));
        service.pool().shutdown();
    }

    #[tokio::test]
    async fn test_failure_then_pass_and_force_pass() {
        let service = test_service(registry()).await;
        let _workers = service.pool().start();
        let template = Template::builder("failing")
            .scope(MaintenanceScope::Global)
            .node(NodeTemplate::single("Fail"))
            .node(NodeTemplate::single("Succeed"))
            .build()
            .unwrap();
        let dag = service
            .create_dag_by_template(&template, &TaskContext::new(), &[], "")
            .await
            .unwrap();

        let failed = drive(&service, dag.id).await;
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.nodes[0].sub_tasks[0].logs, vec!["Unexpected error: boom".to_string()]);

        // A FAILED DAG still holds the scope until passed.
        let err = service
            .create_dag_by_template(&template, &TaskContext::new(), &[], "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskMaintenanceConflict);

        let err = service.operate(dag.id, Operator::Rollback).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskOperatorNotAllowed);

        let second = service
            .create_dag_by_template(&template, &TaskContext::new(), &[dag.id, GenericId::local(999)], "")
            .await
            .unwrap();
        let passed = service.get_dag(dag.id, false).await.unwrap();
        assert_eq!(passed.state, TaskState::Succeed);
        assert_eq!(passed.operator, Operator::Pass);

        let failed = drive(&service, second.id).await;
        service.operate(second.id, Operator::Pass).await.unwrap();
        let done = drive(&service, second.id).await;
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(done.state, TaskState::Succeed);
        assert_eq!(done.nodes[0].sub_tasks[0].operator, Operator::Pass);
        service.pool().shutdown();
    }

    /// Advance `id` until it is terminal.
    pub(crate) async fn drive(service: &TaskService, id: GenericId) -> DagDetail {
        for _ in 0..200 {
            service.advance_dag(id).await.unwrap();
            let detail = service.get_dag(id, true).await.unwrap();
            if detail.is_finished() {
                return detail;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("dag {} did not finish", id);
    }
}
