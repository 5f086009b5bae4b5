// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence: the local store, and the cluster store of a
//! single-node deployment.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqlitePoolOptions, SqliteQueryResult};

use crate::agent::{AgentIdentity, AgentRole};
use crate::error::{Error, Result};
use crate::migrations::SQLITE as MIGRATOR;

use super::{LocalStore, MirrorRecord, SubTaskLogRecord, SubTaskRecord};

const UPSERT_OCS_CONFIG: &str = r#"
    INSERT INTO ocs_config (name, value, updated_at) VALUES (?, ?, ?)
    ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
"#;

const UPSERT_AGENT_TOKEN: &str = r#"
    INSERT INTO agent_token (ip, port, token, updated_at) VALUES (?, ?, ?, ?)
    ON CONFLICT(ip, port) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at
"#;

fn last_insert_id(res: &SqliteQueryResult) -> i64 {
    res.last_insert_rowid()
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let local = SqlitePersistence::from_path(config.local_db_path()).await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::unexpected(format!("failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| Error::unexpected(format!("failed to open {:?}: {}", path, e)))?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// A private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl_task_store!(SqlitePersistence);
impl_cluster_store!(SqlitePersistence, sqlx::Sqlite);

#[async_trait]
impl LocalStore for SqlitePersistence {
    async fn get_identity(&self) -> Result<Option<AgentIdentity>> {
        let row = sqlx::query_as::<_, (String, i32, i32, String, String, String)>(
            "SELECT ip, port, sql_port, zone, version, role FROM agent_identity WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((ip, port, sql_port, zone, version, role)) = row else {
            return Ok(None);
        };
        Ok(Some(AgentIdentity {
            ip,
            port: u16::try_from(port).map_err(|_| Error::unexpected("stored port out of range"))?,
            sql_port: u16::try_from(sql_port)
                .map_err(|_| Error::unexpected("stored sql port out of range"))?,
            zone,
            version,
            role: AgentRole::parse(&role)?,
        }))
    }

    async fn save_identity(&self, identity: &AgentIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_identity (id, ip, port, sql_port, zone, version, role, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ip = excluded.ip, port = excluded.port, sql_port = excluded.sql_port,
                zone = excluded.zone, version = excluded.version, role = excluded.role,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&identity.ip)
        .bind(i32::from(identity.port))
        .bind(i32::from(identity.sql_port))
        .bind(&identity.zone)
        .bind(&identity.version)
        .bind(identity.role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM secret WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_secret(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO secret (name, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_config(&self, name: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM global_config WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set_config(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO global_config (name, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_mirror(&self, task: &SubTaskRecord, logs: &[String]) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sub_task_mirror
                (sub_task_id, state, operator, execute_times, data, additional_data,
                 started_at, end_at, is_sync, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, FALSE, ?)
            ON CONFLICT(sub_task_id) DO UPDATE SET
                state = excluded.state, operator = excluded.operator,
                execute_times = excluded.execute_times, data = excluded.data,
                additional_data = excluded.additional_data, started_at = excluded.started_at,
                end_at = excluded.end_at, is_sync = FALSE, updated_at = excluded.updated_at
            "#,
        )
        .bind(task.id)
        .bind(&task.state)
        .bind(&task.operator)
        .bind(task.execute_times)
        .bind(&task.data)
        .bind(&task.additional_data)
        .bind(task.started_at)
        .bind(task.end_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for line in logs {
            sqlx::query(
                r#"
                INSERT INTO sub_task_log
                    (sub_task_id, execute_times, content, is_local, is_sync, created_at)
                VALUES (?, ?, ?, FALSE, FALSE, ?)
                "#,
            )
            .bind(task.id)
            .bind(task.execute_times)
            .bind(line)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_unsynced_mirrors(&self, limit: i64) -> Result<Vec<MirrorRecord>> {
        let records = sqlx::query_as::<_, MirrorRecord>(
            "SELECT * FROM sub_task_mirror WHERE is_sync = FALSE ORDER BY updated_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn mark_mirror_synced(&self, sub_task_id: i64, as_of: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE sub_task_mirror SET is_sync = TRUE WHERE sub_task_id = ? AND updated_at = ?",
        )
        .bind(sub_task_id)
        .bind(as_of)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_unsynced_logs(&self, after_id: i64, limit: i64) -> Result<Vec<SubTaskLogRecord>> {
        let records = sqlx::query_as::<_, SubTaskLogRecord>(
            r#"
            SELECT * FROM sub_task_log
            WHERE is_local = FALSE AND is_sync = FALSE AND id > ?
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn mark_logs_synced(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut builder =
            sqlx::QueryBuilder::<sqlx::Sqlite>::new("UPDATE sub_task_log SET is_sync = TRUE WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::persistence::{
        ClusterStore, CreateOutcome, NewCredential, NewDag, NewNode, NewPackage, NewSubTask,
        ShippedLog, TaskStore,
    };
    use crate::task::{MaintenanceScope, TaskFlags};

    async fn test_persistence() -> SqlitePersistence {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        SqlitePersistence::new(pool)
    }

    fn new_dag(name: &str, scope: MaintenanceScope) -> NewDag {
        NewDag {
            name: name.to_string(),
            maintenance_type: scope.type_str().to_string(),
            maintenance_key: scope.key().to_string(),
            context: "{}".to_string(),
            trace_id: "trace".to_string(),
            nodes: vec![
                NewNode {
                    name: "first".to_string(),
                    parallel: true,
                    tasks: vec![
                        new_task("A", "10.0.0.1:2886"),
                        new_task("A", "10.0.0.2:2886"),
                    ],
                },
                NewNode {
                    name: "second".to_string(),
                    parallel: false,
                    tasks: vec![new_task("B", "10.0.0.1:2886")],
                },
            ],
        }
    }

    fn new_task(type_name: &str, agent: &str) -> NewSubTask {
        NewSubTask {
            type_name: type_name.to_string(),
            name: type_name.to_string(),
            flags: TaskFlags::new().passable(),
            execute_agent: agent.to_string(),
            data: "{}".to_string(),
        }
    }

    async fn created(store: &SqlitePersistence, dag: &NewDag) -> i64 {
        match store.create_dag(dag, &[]).await.unwrap() {
            CreateOutcome::Created(record) => record.id,
            other => panic!("expected created, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_dag_persists_nodes_and_tasks() {
        let store = test_persistence().await;
        let id = created(&store, &new_dag("start", MaintenanceScope::Global)).await;

        let dag = store.get_dag(id).await.unwrap().unwrap();
        assert_eq!(dag.stage, 1);
        assert_eq!(dag.max_stage, 2);
        assert_eq!(dag.state, "READY");
        assert_eq!(dag.operator, "RUN");

        let nodes = store.list_nodes(id).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].seq, 1);
        assert!(!nodes[1].parallel);

        let tasks = store.list_sub_tasks(id).await.unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].node_id, nodes[0].id);
        assert_eq!(tasks[2].node_id, nodes[1].id);
        assert!(tasks.iter().all(|t| t.state == "PENDING" && t.execute_times == 1));
        assert!(tasks[0].can_pass && tasks[0].can_retry && !tasks[0].can_cancel);
    }

    #[tokio::test]
    async fn test_intersecting_scope_conflicts() {
        let store = test_persistence().await;
        let first = created(&store, &new_dag("a", MaintenanceScope::Tenant("t1".into()))).await;

        let outcome = store
            .create_dag(&new_dag("b", MaintenanceScope::Global), &[])
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Conflict { holder: first });

        // Disjoint tenants and unscoped DAGs do not conflict.
        created(&store, &new_dag("c", MaintenanceScope::Tenant("t2".into()))).await;
        created(&store, &new_dag("d", MaintenanceScope::UnMaintenance)).await;
    }

    #[tokio::test]
    async fn test_force_pass_releases_failed_holder() {
        let store = test_persistence().await;
        let first = created(&store, &new_dag("a", MaintenanceScope::Global)).await;

        let mut dag = store.get_dag(first).await.unwrap().unwrap();
        dag.state = "FAILED".to_string();
        store.update_dag(&dag).await.unwrap();

        // Unknown ids are ignored.
        let outcome = store
            .create_dag(&new_dag("b", MaintenanceScope::Global), &[first, 9999])
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));

        let passed = store.get_dag(first).await.unwrap().unwrap();
        assert_eq!(passed.state, "SUCCEED");
        assert_eq!(passed.operator, "PASS");
    }

    #[tokio::test]
    async fn test_conflict_rolls_back_force_pass() {
        let store = test_persistence().await;
        let failed = created(&store, &new_dag("a", MaintenanceScope::Tenant("t1".into()))).await;
        let mut dag = store.get_dag(failed).await.unwrap().unwrap();
        dag.state = "FAILED".to_string();
        store.update_dag(&dag).await.unwrap();
        let running = created(&store, &new_dag("b", MaintenanceScope::Tenant("t2".into()))).await;

        let outcome = store
            .create_dag(&new_dag("c", MaintenanceScope::Global), &[failed])
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Conflict { holder: running });
        assert_eq!(store.get_dag(failed).await.unwrap().unwrap().state, "FAILED");
    }

    #[tokio::test]
    async fn test_sub_task_transition_and_log_order() {
        let store = test_persistence().await;
        let id = created(&store, &new_dag("a", MaintenanceScope::UnMaintenance)).await;
        let mut task = store.list_sub_tasks(id).await.unwrap().remove(0);

        task.state = "FAILED".to_string();
        store
            .update_sub_task(&task, &["first try".to_string()])
            .await
            .unwrap();

        task.state = "SUCCEED".to_string();
        task.execute_times = 2;
        store
            .update_sub_task(&task, &["second try".to_string()])
            .await
            .unwrap();
        store
            .append_logs(task.id, 1, &["late line of attempt one".to_string()])
            .await
            .unwrap();

        let logs = store.list_logs(task.id).await.unwrap();
        let contents: Vec<_> = logs.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["first try", "late line of attempt one", "second try"]
        );

        let stored = store.get_sub_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, "SUCCEED");
        assert_eq!(stored.execute_times, 2);
    }

    #[tokio::test]
    async fn test_runnable_sub_tasks_per_agent() {
        let store = test_persistence().await;
        let id = created(&store, &new_dag("a", MaintenanceScope::UnMaintenance)).await;
        let tasks = store.list_sub_tasks(id).await.unwrap();
        for task in &tasks {
            let mut t = task.clone();
            t.state = "READY".to_string();
            store.update_sub_task(&t, &[]).await.unwrap();
        }

        let mine = store.list_runnable_sub_tasks("10.0.0.1:2886").await.unwrap();
        assert_eq!(mine.len(), 2);
        let theirs = store.list_runnable_sub_tasks("10.0.0.2:2886").await.unwrap();
        assert_eq!(theirs.len(), 1);
    }

    #[tokio::test]
    async fn test_identity_and_secrets() {
        let store = test_persistence().await;
        assert!(store.get_identity().await.unwrap().is_none());

        let mut identity = AgentIdentity::single("10.0.0.1", 2886, 2881);
        store.save_identity(&identity).await.unwrap();
        identity.role = AgentRole::Follower;
        identity.zone = "z1".to_string();
        store.save_identity(&identity).await.unwrap();
        assert_eq!(store.get_identity().await.unwrap(), Some(identity));

        store.set_secret("agent_token", "abc").await.unwrap();
        store.set_secret("agent_token", "def").await.unwrap();
        assert_eq!(
            store.get_secret("agent_token").await.unwrap().as_deref(),
            Some("def")
        );
        assert!(store.get_config("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mirror_and_unsynced_logs() {
        let store = test_persistence().await;
        let id = created(&store, &new_dag("a", MaintenanceScope::UnMaintenance)).await;
        let mut task = store.list_sub_tasks(id).await.unwrap().remove(0);
        task.state = "SUCCEED".to_string();

        store
            .save_mirror(&task, &["l1".to_string(), "l2".to_string()])
            .await
            .unwrap();

        let mirrors = store.list_unsynced_mirrors(10).await.unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].state, "SUCCEED");

        let logs = store.list_unsynced_logs(0, 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(!logs[0].is_local);

        let tail = store.list_unsynced_logs(logs[0].id, 10).await.unwrap();
        assert_eq!(tail.len(), 1);

        store.mark_logs_synced(&[logs[0].id]).await.unwrap();
        assert_eq!(store.list_unsynced_logs(0, 10).await.unwrap().len(), 1);

        store
            .mark_mirror_synced(task.id, mirrors[0].updated_at)
            .await
            .unwrap();
        assert!(store.list_unsynced_mirrors(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agents_and_tokens() {
        let store = test_persistence().await;
        let mut follower = AgentIdentity::single("10.0.0.2", 2886, 2881);
        follower.role = AgentRole::Follower;
        store
            .insert_agent(&follower, AgentStatus::Active, "tok")
            .await
            .unwrap();
        store
            .insert_agent(
                &AgentIdentity::single("10.0.0.1", 2886, 2881),
                AgentStatus::Active,
                "tok0",
            )
            .await
            .unwrap();

        let agents = store.list_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].ip, "10.0.0.1");
        assert_eq!(agents[1].identity().unwrap(), follower);

        store.set_agent_token("10.0.0.2", 2886, "tok2").await.unwrap();
        assert_eq!(
            store.get_agent_token("10.0.0.2", 2886).await.unwrap().as_deref(),
            Some("tok2")
        );

        assert!(store.delete_agent("10.0.0.2", 2886).await.unwrap());
        assert!(!store.delete_agent("10.0.0.2", 2886).await.unwrap());
        assert!(store.get_agent_token("10.0.0.2", 2886).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credential_rotation_is_atomic_per_row() {
        let store = test_persistence().await;
        let mut ids = Vec::new();
        for name in ["c1", "c2"] {
            ids.push(
                store
                    .insert_credential(&NewCredential {
                        target_type: "HOST".to_string(),
                        name: name.to_string(),
                        description: String::new(),
                        targets: "[]".to_string(),
                        username: "admin".to_string(),
                        auth_type: "PASSWORD".to_string(),
                        passphrase: format!("old-{}", name),
                    })
                    .await
                    .unwrap(),
            );
        }

        store
            .rotate_credentials(
                "credential_secret_key",
                "new-key",
                &[(ids[0], "new-c1".to_string()), (ids[1], "new-c2".to_string())],
            )
            .await
            .unwrap();

        assert_eq!(
            store
                .get_ocs_config("credential_secret_key")
                .await
                .unwrap()
                .as_deref(),
            Some("new-key")
        );
        let all = store.list_credentials(Some("HOST")).await.unwrap();
        assert_eq!(all[0].passphrase, "new-c1");
        assert_eq!(all[1].passphrase, "new-c2");

        assert_eq!(store.delete_credentials(&ids).await.unwrap(), 2);
        assert!(store.list_credentials(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_package_chunks_round_trip() {
        let store = test_persistence().await;
        let chunks = vec![vec![1u8, 2, 3], vec![4u8, 5]];
        let id = store
            .insert_package(
                &NewPackage {
                    name: "oceanbase".to_string(),
                    version: "4.3.0.0".to_string(),
                    release_distribution: "200.el7".to_string(),
                    distribution: "el7".to_string(),
                    architecture: "x86_64".to_string(),
                    size: 5,
                    sha256: "00".to_string(),
                    upgrade_dep_yaml: String::new(),
                },
                &chunks,
            )
            .await
            .unwrap();

        let header = store.get_package(id).await.unwrap().unwrap();
        assert_eq!(header.chunk_count, 2);
        assert_eq!(store.load_package_chunks(id).await.unwrap(), chunks);
    }

    #[tokio::test]
    async fn test_apply_mirror_skips_newer_attempts() {
        let store = test_persistence().await;
        let id = created(&store, &new_dag("a", MaintenanceScope::UnMaintenance)).await;
        let mut task = store.list_sub_tasks(id).await.unwrap().remove(0);
        task.state = "SUCCEED".to_string();
        let mirror = MirrorRecord::from(&task);

        task.state = "READY".to_string();
        task.execute_times = 2;
        store.update_sub_task(&task, &[]).await.unwrap();
        assert!(!store.apply_mirror(&mirror).await.unwrap());

        let mut current = MirrorRecord::from(&task);
        current.state = "FAILED".to_string();
        assert!(store.apply_mirror(&current).await.unwrap());
        assert_eq!(
            store.get_sub_task(task.id).await.unwrap().unwrap().state,
            "FAILED"
        );

        store
            .insert_shipped_logs(&[ShippedLog {
                sub_task_id: task.id,
                execute_times: 2,
                content: "shipped".to_string(),
                created_at: Utc::now(),
            }])
            .await
            .unwrap();
        assert_eq!(store.list_logs(task.id).await.unwrap().len(), 1);
    }
}
