// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for obshell-core.
//!
//! Two stores back every agent:
//!
//! | Store | Backend | Holds |
//! |-------|---------|-------|
//! | local | SQLite under `<home>/run` | identity, secrets, local DAGs, sync state |
//! | cluster | MySQL (or SQLite on a single node) | cluster DAGs, agents, tokens, credentials, packages |
//!
//! [`TaskStore`] is implemented by both backends; [`LocalStore`] only by
//! SQLite; [`ClusterStore`] by both.

#[macro_use]
mod shared;

pub mod mysql;
pub mod sqlite;

pub use self::mysql::MySqlPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::agent::{AgentIdentity, AgentRole, AgentStatus};
use crate::error::Result;
use crate::task::{Operator, StoreScope, TaskFlags, TaskState};

/// DAG row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DagRecord {
    /// Row id.
    pub id: i64,
    /// Human name.
    pub name: String,
    /// 1-based current node.
    pub stage: i32,
    /// Number of nodes.
    pub max_stage: i32,
    /// Persisted [`TaskState`].
    pub state: String,
    /// Persisted [`Operator`].
    pub operator: String,
    /// Scope type column.
    pub maintenance_type: String,
    /// Scope key column.
    pub maintenance_key: String,
    /// JSON of the task context.
    pub context: String,
    /// Trace id of the creating request.
    pub trace_id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First scheduling time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub end_at: Option<DateTime<Utc>>,
}

/// Node row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct NodeRecord {
    /// Row id.
    pub id: i64,
    /// Owning DAG.
    pub dag_id: i64,
    /// 1-based position in the DAG.
    pub seq: i32,
    /// Node name.
    pub name: String,
    /// Whether sub-tasks run concurrently.
    pub parallel: bool,
    /// Persisted [`TaskState`].
    pub state: String,
    /// Persisted [`Operator`].
    pub operator: String,
    /// First scheduling time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub end_at: Option<DateTime<Utc>>,
}

/// Sub-task row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SubTaskRecord {
    /// Row id.
    pub id: i64,
    /// Owning DAG.
    pub dag_id: i64,
    /// Owning node.
    pub node_id: i64,
    /// 0-based position in the node.
    pub seq: i32,
    /// Registered task type.
    pub type_name: String,
    /// Display name.
    pub name: String,
    /// Persisted [`TaskState`].
    pub state: String,
    /// Persisted [`Operator`].
    pub operator: String,
    /// Capability flag.
    pub can_cancel: bool,
    /// Capability flag.
    pub can_continue: bool,
    /// Capability flag.
    pub can_pass: bool,
    /// Capability flag.
    pub can_retry: bool,
    /// Capability flag.
    pub can_rollback: bool,
    /// Attempt counter, starting at 1.
    pub execute_times: i32,
    /// Executing agent as `ip:port`.
    pub execute_agent: String,
    /// JSON of the sub-task's own data.
    pub data: String,
    /// JSON exposed through the DAG detail.
    pub additional_data: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the current attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time of the current attempt.
    pub end_at: Option<DateTime<Utc>>,
}

impl SubTaskRecord {
    /// Capability flags.
    pub fn flags(&self) -> TaskFlags {
        TaskFlags {
            can_cancel: self.can_cancel,
            can_continue: self.can_continue,
            can_pass: self.can_pass,
            can_retry: self.can_retry,
            can_rollback: self.can_rollback,
        }
    }

    /// Parsed state.
    pub fn task_state(&self) -> Result<TaskState> {
        TaskState::parse(&self.state)
    }

    /// Parsed operator.
    pub fn task_operator(&self) -> Result<Operator> {
        Operator::parse(&self.operator)
    }
}

impl DagRecord {
    /// Parsed state.
    pub fn task_state(&self) -> Result<TaskState> {
        TaskState::parse(&self.state)
    }

    /// Parsed operator.
    pub fn task_operator(&self) -> Result<Operator> {
        Operator::parse(&self.operator)
    }
}

impl NodeRecord {
    /// Parsed state.
    pub fn task_state(&self) -> Result<TaskState> {
        TaskState::parse(&self.state)
    }

    /// Parsed operator.
    pub fn task_operator(&self) -> Result<Operator> {
        Operator::parse(&self.operator)
    }
}

/// Sub-task log row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SubTaskLogRecord {
    /// Row id.
    pub id: i64,
    /// Sub-task the line belongs to.
    pub sub_task_id: i64,
    /// Attempt that produced the line.
    pub execute_times: i32,
    /// Log line.
    pub content: String,
    /// Whether the sub-task lives in the same store as the log row.
    pub is_local: bool,
    /// Whether the row has reached its authoritative store.
    pub is_sync: bool,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Local copy of a cluster sub-task transition.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MirrorRecord {
    /// Cluster sub-task id.
    pub sub_task_id: i64,
    /// Persisted [`TaskState`].
    pub state: String,
    /// Persisted [`Operator`].
    pub operator: String,
    /// Attempt counter.
    pub execute_times: i32,
    /// Sub-task data JSON.
    pub data: String,
    /// Additional data JSON.
    pub additional_data: String,
    /// Start of the attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time of the attempt.
    pub end_at: Option<DateTime<Utc>>,
    /// Whether pushed to the cluster store.
    pub is_sync: bool,
    /// Last local write.
    pub updated_at: DateTime<Utc>,
}

impl From<&SubTaskRecord> for MirrorRecord {
    fn from(task: &SubTaskRecord) -> Self {
        Self {
            sub_task_id: task.id,
            state: task.state.clone(),
            operator: task.operator.clone(),
            execute_times: task.execute_times,
            data: task.data.clone(),
            additional_data: task.additional_data.clone(),
            started_at: task.started_at,
            end_at: task.end_at,
            is_sync: false,
            updated_at: Utc::now(),
        }
    }
}

/// Registered agent row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AgentRecord {
    /// Agent ip.
    pub ip: String,
    /// Agent HTTP port.
    pub port: i32,
    /// Database SQL port.
    pub sql_port: i32,
    /// Zone.
    pub zone: String,
    /// Agent version.
    pub version: String,
    /// Persisted [`AgentRole`].
    pub role: String,
    /// Persisted [`AgentStatus`].
    pub status: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Typed identity.
    pub fn identity(&self) -> Result<AgentIdentity> {
        Ok(AgentIdentity {
            ip: self.ip.clone(),
            port: u16::try_from(self.port)
                .map_err(|_| crate::error::Error::unexpected("agent port out of range"))?,
            sql_port: u16::try_from(self.sql_port)
                .map_err(|_| crate::error::Error::unexpected("sql port out of range"))?,
            zone: self.zone.clone(),
            version: self.version.clone(),
            role: AgentRole::parse(&self.role)?,
        })
    }

    /// Typed status.
    pub fn agent_status(&self) -> AgentStatus {
        AgentStatus::parse(&self.status)
    }
}

/// Stored SSH credential row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CredentialRecord {
    /// Row id.
    pub id: i64,
    /// Target type, e.g. `HOST`.
    pub target_type: String,
    /// Unique name per target type.
    pub name: String,
    /// Free text.
    pub description: String,
    /// JSON array of `{ip, port}` targets.
    pub targets: String,
    /// SSH user.
    pub username: String,
    /// Authentication type, e.g. `PASSWORD`.
    pub auth_type: String,
    /// AES-GCM wrapped passphrase.
    pub passphrase: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// Upgrade package header row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PackageRecord {
    /// Row id.
    pub id: i64,
    /// Package name.
    pub name: String,
    /// Build version, e.g. `4.3.0.0`.
    pub version: String,
    /// Release with distribution suffix, e.g. `100000.el7`.
    pub release_distribution: String,
    /// Distribution, e.g. `el7`.
    pub distribution: String,
    /// Architecture, e.g. `x86_64`.
    pub architecture: String,
    /// Payload size in bytes.
    pub size: i64,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
    /// Number of chunk rows.
    pub chunk_count: i32,
    /// Embedded upgrade dependency YAML.
    pub upgrade_dep_yaml: String,
    /// Upload time.
    pub created_at: DateTime<Utc>,
}

/// A sub-task to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubTask {
    /// Registered type.
    pub type_name: String,
    /// Display name.
    pub name: String,
    /// Capability flags.
    pub flags: TaskFlags,
    /// Executing agent as `ip:port`.
    pub execute_agent: String,
    /// Initial data JSON.
    pub data: String,
}

/// A node to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    /// Node name.
    pub name: String,
    /// Whether sub-tasks run concurrently.
    pub parallel: bool,
    /// Sub-tasks in declared order.
    pub tasks: Vec<NewSubTask>,
}

/// A DAG to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDag {
    /// Human name.
    pub name: String,
    /// Scope type column.
    pub maintenance_type: String,
    /// Scope key column.
    pub maintenance_key: String,
    /// Context JSON.
    pub context: String,
    /// Trace id of the creating request.
    pub trace_id: String,
    /// Nodes in order.
    pub nodes: Vec<NewNode>,
}

/// A credential to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCredential {
    /// Target type.
    pub target_type: String,
    /// Unique name per target type.
    pub name: String,
    /// Free text.
    pub description: String,
    /// JSON array of targets.
    pub targets: String,
    /// SSH user.
    pub username: String,
    /// Authentication type.
    pub auth_type: String,
    /// Wrapped passphrase.
    pub passphrase: String,
}

/// An upgrade package header to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPackage {
    /// Package name.
    pub name: String,
    /// Build version.
    pub version: String,
    /// Release with distribution suffix.
    pub release_distribution: String,
    /// Distribution.
    pub distribution: String,
    /// Architecture.
    pub architecture: String,
    /// Payload size.
    pub size: i64,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
    /// Embedded dependency YAML.
    pub upgrade_dep_yaml: String,
}

/// Outcome of one DAG creation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The DAG was persisted.
    Created(DagRecord),
    /// A live DAG with an intersecting scope holds the scope.
    Conflict {
        /// Row id of the holder.
        holder: i64,
    },
    /// Another writer bumped the scope version first.
    RaceLost,
}

/// DAG, node, sub-task and log persistence shared by both stores.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Force-pass FAILED DAGs among `force_pass`, check the scope, and
    /// insert the DAG with its nodes and sub-tasks in one transaction.
    async fn create_dag(&self, dag: &NewDag, force_pass: &[i64]) -> Result<CreateOutcome>;

    /// Fetch a DAG.
    async fn get_dag(&self, id: i64) -> Result<Option<DagRecord>>;

    /// Write stage, state, operator and times of a DAG.
    async fn update_dag(&self, dag: &DagRecord) -> Result<()>;

    /// Replace the context JSON of a DAG.
    async fn update_dag_context(&self, id: i64, context: &str) -> Result<()>;

    /// DAGs in PENDING, READY or RUNNING.
    async fn list_active_dags(&self) -> Result<Vec<DagRecord>>;

    /// Non-SUCCEED DAGs with a maintenance scope, newest first.
    async fn list_maintenance_holders(&self) -> Result<Vec<DagRecord>>;

    /// Nodes of a DAG ordered by position.
    async fn list_nodes(&self, dag_id: i64) -> Result<Vec<NodeRecord>>;

    /// Write state, operator and times of a node.
    async fn update_node(&self, node: &NodeRecord) -> Result<()>;

    /// Sub-tasks of a DAG ordered by node position then declared order.
    async fn list_sub_tasks(&self, dag_id: i64) -> Result<Vec<SubTaskRecord>>;

    /// Fetch a sub-task.
    async fn get_sub_task(&self, id: i64) -> Result<Option<SubTaskRecord>>;

    /// Write a sub-task transition and its log lines atomically.
    async fn update_sub_task(&self, task: &SubTaskRecord, logs: &[String]) -> Result<()>;

    /// Append log lines for the current attempt of a sub-task.
    async fn append_logs(&self, sub_task_id: i64, execute_times: i32, logs: &[String])
    -> Result<()>;

    /// Logs of a sub-task ordered by attempt then append order.
    async fn list_logs(&self, sub_task_id: i64) -> Result<Vec<SubTaskLogRecord>>;

    /// READY or RUNNING sub-tasks assigned to `agent` (`ip:port`).
    async fn list_runnable_sub_tasks(&self, agent: &str) -> Result<Vec<SubTaskRecord>>;
}

/// Agent-private persistence.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Persisted identity.
    async fn get_identity(&self) -> Result<Option<AgentIdentity>>;

    /// Persist the identity.
    async fn save_identity(&self, identity: &AgentIdentity) -> Result<()>;

    /// Read a secret.
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;

    /// Write a secret.
    async fn set_secret(&self, name: &str, value: &str) -> Result<()>;

    /// Read a local configuration value.
    async fn get_config(&self, name: &str) -> Result<Option<String>>;

    /// Write a local configuration value.
    async fn set_config(&self, name: &str, value: &str) -> Result<()>;

    /// Record a cluster sub-task transition locally, with its log lines,
    /// when the cluster store cannot take it.
    async fn save_mirror(&self, task: &SubTaskRecord, logs: &[String]) -> Result<()>;

    /// Mirror rows not pushed yet.
    async fn list_unsynced_mirrors(&self, limit: i64) -> Result<Vec<MirrorRecord>>;

    /// Mark a mirror row pushed, unless it changed after `as_of`.
    async fn mark_mirror_synced(&self, sub_task_id: i64, as_of: DateTime<Utc>) -> Result<()>;

    /// Unsynced log rows of cluster sub-tasks with id above `after_id`.
    async fn list_unsynced_logs(&self, after_id: i64, limit: i64) -> Result<Vec<SubTaskLogRecord>>;

    /// Mark log rows shipped.
    async fn mark_logs_synced(&self, ids: &[i64]) -> Result<()>;
}

/// Cluster-wide persistence.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// All registered agents ordered by `(ip, port)`.
    async fn list_agents(&self) -> Result<Vec<AgentRecord>>;

    /// Fetch one agent.
    async fn get_agent(&self, ip: &str, port: u16) -> Result<Option<AgentRecord>>;

    /// Register an agent and its token in one transaction.
    async fn insert_agent(
        &self,
        identity: &AgentIdentity,
        status: AgentStatus,
        token: &str,
    ) -> Result<()>;

    /// Update an agent's identity columns.
    async fn update_agent(&self, identity: &AgentIdentity) -> Result<()>;

    /// Update an agent's status.
    async fn set_agent_status(&self, ip: &str, port: u16, status: AgentStatus) -> Result<()>;

    /// Remove an agent and its token; returns whether it existed.
    async fn delete_agent(&self, ip: &str, port: u16) -> Result<bool>;

    /// Token of an agent.
    async fn get_agent_token(&self, ip: &str, port: u16) -> Result<Option<String>>;

    /// Replace the token of an agent.
    async fn set_agent_token(&self, ip: &str, port: u16, token: &str) -> Result<()>;

    /// Read a cluster configuration value.
    async fn get_ocs_config(&self, name: &str) -> Result<Option<String>>;

    /// Write a cluster configuration value.
    async fn set_ocs_config(&self, name: &str, value: &str) -> Result<()>;

    /// Insert a credential.
    async fn insert_credential(&self, credential: &NewCredential) -> Result<i64>;

    /// Fetch a credential.
    async fn get_credential(&self, id: i64) -> Result<Option<CredentialRecord>>;

    /// Fetch a credential by its unique name.
    async fn find_credential(&self, target_type: &str, name: &str)
    -> Result<Option<CredentialRecord>>;

    /// All credentials, optionally filtered by target type.
    async fn list_credentials(&self, target_type: Option<&str>) -> Result<Vec<CredentialRecord>>;

    /// Update description, targets, user, auth type and passphrase.
    async fn update_credential(&self, credential: &CredentialRecord) -> Result<()>;

    /// Delete credentials; returns the number removed.
    async fn delete_credentials(&self, ids: &[i64]) -> Result<u64>;

    /// Store a new secret key and every re-wrapped passphrase atomically.
    async fn rotate_credentials(
        &self,
        config_name: &str,
        stored_key: &str,
        rewrapped: &[(i64, String)],
    ) -> Result<()>;

    /// Insert a package header and its chunks atomically.
    async fn insert_package(&self, package: &NewPackage, chunks: &[Vec<u8>]) -> Result<i64>;

    /// All package headers.
    async fn list_packages(&self) -> Result<Vec<PackageRecord>>;

    /// Fetch a package header.
    async fn get_package(&self, id: i64) -> Result<Option<PackageRecord>>;

    /// Chunks of a package in order.
    async fn load_package_chunks(&self, pkg_id: i64) -> Result<Vec<Vec<u8>>>;

    /// Insert log rows shipped by an agent.
    async fn insert_shipped_logs(&self, logs: &[ShippedLog]) -> Result<()>;

    /// Apply a locally mirrored transition unless the cluster row moved on.
    async fn apply_mirror(&self, mirror: &MirrorRecord) -> Result<bool>;
}

/// A log line shipped from an agent to the cluster store.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShippedLog {
    /// Cluster sub-task id.
    pub sub_task_id: i64,
    /// Attempt that produced the line.
    pub execute_times: i32,
    /// Log line.
    pub content: String,
    /// Original append time.
    pub created_at: DateTime<Utc>,
}

/// The two stores of an agent.
#[derive(Clone)]
pub struct Stores {
    /// Agent-private store.
    pub local: Arc<dyn LocalStore>,
    /// Cluster store.
    pub cluster: Arc<dyn ClusterStore>,
    local_tasks: Arc<dyn TaskStore>,
    cluster_tasks: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    /// Local SQLite store with a SQLite cluster store. The two must be
    /// distinct databases: DAG ids are only unique per store.
    pub fn sqlite(local: Arc<SqlitePersistence>, cluster: Arc<SqlitePersistence>) -> Self {
        debug_assert!(
            !Arc::ptr_eq(&local, &cluster),
            "local and cluster stores must not share a database"
        );
        Self {
            local: local.clone(),
            local_tasks: local,
            cluster: cluster.clone(),
            cluster_tasks: cluster,
        }
    }

    /// Local SQLite store with a MySQL cluster store.
    pub fn mysql(local: Arc<SqlitePersistence>, cluster: Arc<MySqlPersistence>) -> Self {
        Self {
            local: local.clone(),
            local_tasks: local,
            cluster: cluster.clone(),
            cluster_tasks: cluster,
        }
    }

    /// Task store for a scope.
    pub fn tasks(&self, scope: StoreScope) -> &Arc<dyn TaskStore> {
        match scope {
            StoreScope::Local => &self.local_tasks,
            StoreScope::Cluster => &self.cluster_tasks,
        }
    }
}
