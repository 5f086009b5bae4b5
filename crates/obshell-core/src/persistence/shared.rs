// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL shared by the SQLite and MySQL backends.
//!
//! Both dialects accept `?` placeholders and the statements below, so the
//! trait impls are generated once per backend. The invoking module provides:
//!
//! - a `pool` field on the persistence type
//! - `fn last_insert_id(&QueryResult) -> i64`
//! - `UPSERT_OCS_CONFIG` and `UPSERT_AGENT_TOKEN` statements

macro_rules! impl_task_store {
    ($persistence:ty) => {
        #[async_trait::async_trait]
        impl $crate::persistence::TaskStore for $persistence {
            async fn create_dag(
                &self,
                dag: &$crate::persistence::NewDag,
                force_pass: &[i64],
            ) -> $crate::error::Result<$crate::persistence::CreateOutcome> {
                use $crate::persistence::{CreateOutcome, DagRecord};
                use $crate::task::MaintenanceScope;

                let now = chrono::Utc::now();
                let mut tx = self.pool.begin().await?;

                // A missing or non-FAILED id is left alone.
                for id in force_pass {
                    sqlx::query(
                        r#"
                        UPDATE dag_instance
                        SET state = 'SUCCEED', operator = 'PASS', end_at = ?
                        WHERE id = ? AND state = 'FAILED'
                        "#,
                    )
                    .bind(now)
                    .bind(*id)
                    .execute(&mut *tx)
                    .await?;
                }

                let scope =
                    MaintenanceScope::from_columns(&dag.maintenance_type, &dag.maintenance_key)?;
                if scope.is_maintenance() {
                    let version: i64 =
                        sqlx::query_scalar("SELECT version FROM maintenance_scope WHERE id = 1")
                            .fetch_one(&mut *tx)
                            .await?;

                    let live = sqlx::query_as::<_, DagRecord>(
                        r#"
                        SELECT * FROM dag_instance
                        WHERE maintenance_type <> 'UN_MAINTENANCE' AND state <> 'SUCCEED'
                        ORDER BY id DESC
                        "#,
                    )
                    .fetch_all(&mut *tx)
                    .await?;
                    for holder in live {
                        let held = MaintenanceScope::from_columns(
                            &holder.maintenance_type,
                            &holder.maintenance_key,
                        )?;
                        if held.intersects(&scope) {
                            tx.rollback().await?;
                            return Ok(CreateOutcome::Conflict { holder: holder.id });
                        }
                    }

                    let bumped = sqlx::query(
                        "UPDATE maintenance_scope SET version = version + 1 WHERE id = 1 AND version = ?",
                    )
                    .bind(version)
                    .execute(&mut *tx)
                    .await?;
                    if bumped.rows_affected() == 0 {
                        tx.rollback().await?;
                        return Ok(CreateOutcome::RaceLost);
                    }
                }

                let res = sqlx::query(
                    r#"
                    INSERT INTO dag_instance
                        (name, stage, max_stage, state, operator, maintenance_type,
                         maintenance_key, context, trace_id, created_at)
                    VALUES (?, 1, ?, 'READY', 'RUN', ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&dag.name)
                .bind(dag.nodes.len() as i32)
                .bind(&dag.maintenance_type)
                .bind(&dag.maintenance_key)
                .bind(&dag.context)
                .bind(&dag.trace_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                let dag_id = last_insert_id(&res);

                for (node_idx, node) in dag.nodes.iter().enumerate() {
                    let res = sqlx::query(
                        r#"
                        INSERT INTO node_instance (dag_id, seq, name, parallel, state, operator)
                        VALUES (?, ?, ?, ?, 'PENDING', 'RUN')
                        "#,
                    )
                    .bind(dag_id)
                    .bind(node_idx as i32 + 1)
                    .bind(&node.name)
                    .bind(node.parallel)
                    .execute(&mut *tx)
                    .await?;
                    let node_id = last_insert_id(&res);

                    for (task_idx, task) in node.tasks.iter().enumerate() {
                        sqlx::query(
                            r#"
                            INSERT INTO sub_task_instance
                                (dag_id, node_id, seq, type_name, name, state, operator,
                                 can_cancel, can_continue, can_pass, can_retry, can_rollback,
                                 execute_times, execute_agent, data, additional_data, created_at)
                            VALUES (?, ?, ?, ?, ?, 'PENDING', 'RUN', ?, ?, ?, ?, ?, 1, ?, ?, '{}', ?)
                            "#,
                        )
                        .bind(dag_id)
                        .bind(node_id)
                        .bind(task_idx as i32)
                        .bind(&task.type_name)
                        .bind(&task.name)
                        .bind(task.flags.can_cancel)
                        .bind(task.flags.can_continue)
                        .bind(task.flags.can_pass)
                        .bind(task.flags.can_retry)
                        .bind(task.flags.can_rollback)
                        .bind(&task.execute_agent)
                        .bind(&task.data)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    }
                }

                let record = sqlx::query_as::<_, DagRecord>("SELECT * FROM dag_instance WHERE id = ?")
                    .bind(dag_id)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(CreateOutcome::Created(record))
            }

            async fn get_dag(
                &self,
                id: i64,
            ) -> $crate::error::Result<Option<$crate::persistence::DagRecord>> {
                let record = sqlx::query_as::<_, $crate::persistence::DagRecord>(
                    "SELECT * FROM dag_instance WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(record)
            }

            async fn update_dag(
                &self,
                dag: &$crate::persistence::DagRecord,
            ) -> $crate::error::Result<()> {
                sqlx::query(
                    r#"
                    UPDATE dag_instance
                    SET stage = ?, state = ?, operator = ?, started_at = ?, end_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(dag.stage)
                .bind(&dag.state)
                .bind(&dag.operator)
                .bind(dag.started_at)
                .bind(dag.end_at)
                .bind(dag.id)
                .execute(&self.pool)
                .await?;
                Ok(())
            }

            async fn update_dag_context(&self, id: i64, context: &str) -> $crate::error::Result<()> {
                sqlx::query("UPDATE dag_instance SET context = ? WHERE id = ?")
                    .bind(context)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }

            async fn list_active_dags(
                &self,
            ) -> $crate::error::Result<Vec<$crate::persistence::DagRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::DagRecord>(
                    r#"
                    SELECT * FROM dag_instance
                    WHERE state IN ('PENDING', 'READY', 'RUNNING')
                    ORDER BY id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn list_maintenance_holders(
                &self,
            ) -> $crate::error::Result<Vec<$crate::persistence::DagRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::DagRecord>(
                    r#"
                    SELECT * FROM dag_instance
                    WHERE maintenance_type <> 'UN_MAINTENANCE' AND state <> 'SUCCEED'
                    ORDER BY id DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn list_nodes(
                &self,
                dag_id: i64,
            ) -> $crate::error::Result<Vec<$crate::persistence::NodeRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::NodeRecord>(
                    "SELECT * FROM node_instance WHERE dag_id = ? ORDER BY seq",
                )
                .bind(dag_id)
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn update_node(
                &self,
                node: &$crate::persistence::NodeRecord,
            ) -> $crate::error::Result<()> {
                sqlx::query(
                    r#"
                    UPDATE node_instance
                    SET state = ?, operator = ?, started_at = ?, end_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&node.state)
                .bind(&node.operator)
                .bind(node.started_at)
                .bind(node.end_at)
                .bind(node.id)
                .execute(&self.pool)
                .await?;
                Ok(())
            }

            async fn list_sub_tasks(
                &self,
                dag_id: i64,
            ) -> $crate::error::Result<Vec<$crate::persistence::SubTaskRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::SubTaskRecord>(
                    r#"
                    SELECT s.* FROM sub_task_instance s
                    JOIN node_instance n ON s.node_id = n.id
                    WHERE s.dag_id = ?
                    ORDER BY n.seq, s.seq
                    "#,
                )
                .bind(dag_id)
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn get_sub_task(
                &self,
                id: i64,
            ) -> $crate::error::Result<Option<$crate::persistence::SubTaskRecord>> {
                let record = sqlx::query_as::<_, $crate::persistence::SubTaskRecord>(
                    "SELECT * FROM sub_task_instance WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(record)
            }

            async fn update_sub_task(
                &self,
                task: &$crate::persistence::SubTaskRecord,
                logs: &[String],
            ) -> $crate::error::Result<()> {
                let now = chrono::Utc::now();
                let mut tx = self.pool.begin().await?;

                sqlx::query(
                    r#"
                    UPDATE sub_task_instance
                    SET state = ?, operator = ?, execute_times = ?, execute_agent = ?,
                        data = ?, additional_data = ?, started_at = ?, end_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&task.state)
                .bind(&task.operator)
                .bind(task.execute_times)
                .bind(&task.execute_agent)
                .bind(&task.data)
                .bind(&task.additional_data)
                .bind(task.started_at)
                .bind(task.end_at)
                .bind(task.id)
                .execute(&mut *tx)
                .await?;

                for line in logs {
                    sqlx::query(
                        r#"
                        INSERT INTO sub_task_log
                            (sub_task_id, execute_times, content, is_local, is_sync, created_at)
                        VALUES (?, ?, ?, TRUE, TRUE, ?)
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

            async fn append_logs(
                &self,
                sub_task_id: i64,
                execute_times: i32,
                logs: &[String],
            ) -> $crate::error::Result<()> {
                if logs.is_empty() {
                    return Ok(());
                }
                let now = chrono::Utc::now();
                let mut tx = self.pool.begin().await?;
                for line in logs {
                    sqlx::query(
                        r#"
                        INSERT INTO sub_task_log
                            (sub_task_id, execute_times, content, is_local, is_sync, created_at)
                        VALUES (?, ?, ?, TRUE, TRUE, ?)
                        "#,
                    )
                    .bind(sub_task_id)
                    .bind(execute_times)
                    .bind(line)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(())
            }

            async fn list_logs(
                &self,
                sub_task_id: i64,
            ) -> $crate::error::Result<Vec<$crate::persistence::SubTaskLogRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::SubTaskLogRecord>(
                    r#"
                    SELECT * FROM sub_task_log
                    WHERE sub_task_id = ?
                    ORDER BY execute_times, id
                    "#,
                )
                .bind(sub_task_id)
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn list_runnable_sub_tasks(
                &self,
                agent: &str,
            ) -> $crate::error::Result<Vec<$crate::persistence::SubTaskRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::SubTaskRecord>(
                    r#"
                    SELECT * FROM sub_task_instance
                    WHERE execute_agent = ? AND state IN ('READY', 'RUNNING')
                    ORDER BY id
                    "#,
                )
                .bind(agent)
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }
        }
    };
}

macro_rules! impl_cluster_store {
    ($persistence:ty, $db:ty) => {
        #[async_trait::async_trait]
        impl $crate::persistence::ClusterStore for $persistence {
            async fn list_agents(
                &self,
            ) -> $crate::error::Result<Vec<$crate::persistence::AgentRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::AgentRecord>(
                    "SELECT * FROM all_agent ORDER BY ip, port",
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn get_agent(
                &self,
                ip: &str,
                port: u16,
            ) -> $crate::error::Result<Option<$crate::persistence::AgentRecord>> {
                let record = sqlx::query_as::<_, $crate::persistence::AgentRecord>(
                    "SELECT * FROM all_agent WHERE ip = ? AND port = ?",
                )
                .bind(ip)
                .bind(i32::from(port))
                .fetch_optional(&self.pool)
                .await?;
                Ok(record)
            }

            async fn insert_agent(
                &self,
                identity: &$crate::agent::AgentIdentity,
                status: $crate::agent::AgentStatus,
                token: &str,
            ) -> $crate::error::Result<()> {
                let now = chrono::Utc::now();
                let mut tx = self.pool.begin().await?;

                sqlx::query(
                    r#"
                    INSERT INTO all_agent
                        (ip, port, sql_port, zone, version, role, status, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&identity.ip)
                .bind(i32::from(identity.port))
                .bind(i32::from(identity.sql_port))
                .bind(&identity.zone)
                .bind(&identity.version)
                .bind(identity.role.as_str())
                .bind(status.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                sqlx::query(UPSERT_AGENT_TOKEN)
                    .bind(&identity.ip)
                    .bind(i32::from(identity.port))
                    .bind(token)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(())
            }

            async fn update_agent(
                &self,
                identity: &$crate::agent::AgentIdentity,
            ) -> $crate::error::Result<()> {
                sqlx::query(
                    r#"
                    UPDATE all_agent
                    SET sql_port = ?, zone = ?, version = ?, role = ?, updated_at = ?
                    WHERE ip = ? AND port = ?
                    "#,
                )
                .bind(i32::from(identity.sql_port))
                .bind(&identity.zone)
                .bind(&identity.version)
                .bind(identity.role.as_str())
                .bind(chrono::Utc::now())
                .bind(&identity.ip)
                .bind(i32::from(identity.port))
                .execute(&self.pool)
                .await?;
                Ok(())
            }

            async fn set_agent_status(
                &self,
                ip: &str,
                port: u16,
                status: $crate::agent::AgentStatus,
            ) -> $crate::error::Result<()> {
                sqlx::query("UPDATE all_agent SET status = ?, updated_at = ? WHERE ip = ? AND port = ?")
                    .bind(status.as_str())
                    .bind(chrono::Utc::now())
                    .bind(ip)
                    .bind(i32::from(port))
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }

            async fn delete_agent(&self, ip: &str, port: u16) -> $crate::error::Result<bool> {
                let mut tx = self.pool.begin().await?;
                let res = sqlx::query("DELETE FROM all_agent WHERE ip = ? AND port = ?")
                    .bind(ip)
                    .bind(i32::from(port))
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM agent_token WHERE ip = ? AND port = ?")
                    .bind(ip)
                    .bind(i32::from(port))
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(res.rows_affected() > 0)
            }

            async fn get_agent_token(
                &self,
                ip: &str,
                port: u16,
            ) -> $crate::error::Result<Option<String>> {
                let token: Option<String> =
                    sqlx::query_scalar("SELECT token FROM agent_token WHERE ip = ? AND port = ?")
                        .bind(ip)
                        .bind(i32::from(port))
                        .fetch_optional(&self.pool)
                        .await?;
                Ok(token)
            }

            async fn set_agent_token(
                &self,
                ip: &str,
                port: u16,
                token: &str,
            ) -> $crate::error::Result<()> {
                sqlx::query(UPSERT_AGENT_TOKEN)
                    .bind(ip)
                    .bind(i32::from(port))
                    .bind(token)
                    .bind(chrono::Utc::now())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }

            async fn get_ocs_config(&self, name: &str) -> $crate::error::Result<Option<String>> {
                let value: Option<String> =
                    sqlx::query_scalar("SELECT value FROM ocs_config WHERE name = ?")
                        .bind(name)
                        .fetch_optional(&self.pool)
                        .await?;
                Ok(value)
            }

            async fn set_ocs_config(&self, name: &str, value: &str) -> $crate::error::Result<()> {
                sqlx::query(UPSERT_OCS_CONFIG)
                    .bind(name)
                    .bind(value)
                    .bind(chrono::Utc::now())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }

            async fn insert_credential(
                &self,
                credential: &$crate::persistence::NewCredential,
            ) -> $crate::error::Result<i64> {
                let now = chrono::Utc::now();
                let res = sqlx::query(
                    r#"
                    INSERT INTO credential
                        (target_type, name, description, targets, username, auth_type,
                         passphrase, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&credential.target_type)
                .bind(&credential.name)
                .bind(&credential.description)
                .bind(&credential.targets)
                .bind(&credential.username)
                .bind(&credential.auth_type)
                .bind(&credential.passphrase)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(last_insert_id(&res))
            }

            async fn get_credential(
                &self,
                id: i64,
            ) -> $crate::error::Result<Option<$crate::persistence::CredentialRecord>> {
                let record = sqlx::query_as::<_, $crate::persistence::CredentialRecord>(
                    "SELECT * FROM credential WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(record)
            }

            async fn find_credential(
                &self,
                target_type: &str,
                name: &str,
            ) -> $crate::error::Result<Option<$crate::persistence::CredentialRecord>> {
                let record = sqlx::query_as::<_, $crate::persistence::CredentialRecord>(
                    "SELECT * FROM credential WHERE target_type = ? AND name = ?",
                )
                .bind(target_type)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
                Ok(record)
            }

            async fn list_credentials(
                &self,
                target_type: Option<&str>,
            ) -> $crate::error::Result<Vec<$crate::persistence::CredentialRecord>> {
                let records = match target_type {
                    Some(t) => {
                        sqlx::query_as::<_, $crate::persistence::CredentialRecord>(
                            "SELECT * FROM credential WHERE target_type = ? ORDER BY id",
                        )
                        .bind(t)
                        .fetch_all(&self.pool)
                        .await?
                    }
                    None => {
                        sqlx::query_as::<_, $crate::persistence::CredentialRecord>(
                            "SELECT * FROM credential ORDER BY id",
                        )
                        .fetch_all(&self.pool)
                        .await?
                    }
                };
                Ok(records)
            }

            async fn update_credential(
                &self,
                credential: &$crate::persistence::CredentialRecord,
            ) -> $crate::error::Result<()> {
                sqlx::query(
                    r#"
                    UPDATE credential
                    SET description = ?, targets = ?, username = ?, auth_type = ?,
                        passphrase = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&credential.description)
                .bind(&credential.targets)
                .bind(&credential.username)
                .bind(&credential.auth_type)
                .bind(&credential.passphrase)
                .bind(chrono::Utc::now())
                .bind(credential.id)
                .execute(&self.pool)
                .await?;
                Ok(())
            }

            async fn delete_credentials(&self, ids: &[i64]) -> $crate::error::Result<u64> {
                if ids.is_empty() {
                    return Ok(0);
                }
                let mut builder =
                    sqlx::QueryBuilder::<$db>::new("DELETE FROM credential WHERE id IN (");
                let mut separated = builder.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
                let res = builder.build().execute(&self.pool).await?;
                Ok(res.rows_affected())
            }

            async fn rotate_credentials(
                &self,
                config_name: &str,
                stored_key: &str,
                rewrapped: &[(i64, String)],
            ) -> $crate::error::Result<()> {
                let now = chrono::Utc::now();
                let mut tx = self.pool.begin().await?;

                sqlx::query(UPSERT_OCS_CONFIG)
                    .bind(config_name)
                    .bind(stored_key)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                for (id, passphrase) in rewrapped {
                    sqlx::query("UPDATE credential SET passphrase = ?, updated_at = ? WHERE id = ?")
                        .bind(passphrase)
                        .bind(now)
                        .bind(*id)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(())
            }

            async fn insert_package(
                &self,
                package: &$crate::persistence::NewPackage,
                chunks: &[Vec<u8>],
            ) -> $crate::error::Result<i64> {
                let mut tx = self.pool.begin().await?;

                let res = sqlx::query(
                    r#"
                    INSERT INTO upgrade_pkg_info
                        (name, version, release_distribution, distribution, architecture,
                         size, sha256, chunk_count, upgrade_dep_yaml, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&package.name)
                .bind(&package.version)
                .bind(&package.release_distribution)
                .bind(&package.distribution)
                .bind(&package.architecture)
                .bind(package.size)
                .bind(&package.sha256)
                .bind(chunks.len() as i32)
                .bind(&package.upgrade_dep_yaml)
                .bind(chrono::Utc::now())
                .execute(&mut *tx)
                .await?;
                let pkg_id = last_insert_id(&res);

                for (index, chunk) in chunks.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO upgrade_pkg_chunk (pkg_id, chunk_index, payload) VALUES (?, ?, ?)",
                    )
                    .bind(pkg_id)
                    .bind(index as i32)
                    .bind(chunk.as_slice())
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                Ok(pkg_id)
            }

            async fn list_packages(
                &self,
            ) -> $crate::error::Result<Vec<$crate::persistence::PackageRecord>> {
                let records = sqlx::query_as::<_, $crate::persistence::PackageRecord>(
                    "SELECT * FROM upgrade_pkg_info ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?;
                Ok(records)
            }

            async fn get_package(
                &self,
                id: i64,
            ) -> $crate::error::Result<Option<$crate::persistence::PackageRecord>> {
                let record = sqlx::query_as::<_, $crate::persistence::PackageRecord>(
                    "SELECT * FROM upgrade_pkg_info WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
                Ok(record)
            }

            async fn load_package_chunks(&self, pkg_id: i64) -> $crate::error::Result<Vec<Vec<u8>>> {
                let chunks: Vec<Vec<u8>> = sqlx::query_scalar(
                    "SELECT payload FROM upgrade_pkg_chunk WHERE pkg_id = ? ORDER BY chunk_index",
                )
                .bind(pkg_id)
                .fetch_all(&self.pool)
                .await?;
                Ok(chunks)
            }

            async fn insert_shipped_logs(
                &self,
                logs: &[$crate::persistence::ShippedLog],
            ) -> $crate::error::Result<()> {
                if logs.is_empty() {
                    return Ok(());
                }
                let mut tx = self.pool.begin().await?;
                for log in logs {
                    sqlx::query(
                        r#"
                        INSERT INTO sub_task_log
                            (sub_task_id, execute_times, content, is_local, is_sync, created_at)
                        VALUES (?, ?, ?, TRUE, TRUE, ?)
                        "#,
                    )
                    .bind(log.sub_task_id)
                    .bind(log.execute_times)
                    .bind(&log.content)
                    .bind(log.created_at)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(())
            }

            async fn apply_mirror(
                &self,
                mirror: &$crate::persistence::MirrorRecord,
            ) -> $crate::error::Result<bool> {
                let res = sqlx::query(
                    r#"
                    UPDATE sub_task_instance
                    SET state = ?, operator = ?, data = ?, additional_data = ?,
                        started_at = ?, end_at = ?
                    WHERE id = ? AND execute_times = ?
                    "#,
                )
                .bind(&mirror.state)
                .bind(&mirror.operator)
                .bind(&mirror.data)
                .bind(&mirror.additional_data)
                .bind(mirror.started_at)
                .bind(mirror.end_at)
                .bind(mirror.sub_task_id)
                .bind(mirror.execute_times)
                .execute(&self.pool)
                .await?;
                Ok(res.rows_affected() > 0)
            }
        }
    };
}
