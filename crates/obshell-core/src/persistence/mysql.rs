// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MySQL-backed cluster store.
//!
//! The database speaks the MySQL wire protocol, so the shared cluster tables
//! live in the database itself and every agent connects to them.

use sqlx::MySqlPool;
use sqlx::mysql::{MySqlPoolOptions, MySqlQueryResult};

use crate::error::{Error, Result};
use crate::migrations::MYSQL as MIGRATOR;

const UPSERT_OCS_CONFIG: &str = r#"
    INSERT INTO ocs_config (name, value, updated_at) VALUES (?, ?, ?)
    ON DUPLICATE KEY UPDATE value = VALUES(value), updated_at = VALUES(updated_at)
"#;

const UPSERT_AGENT_TOKEN: &str = r#"
    INSERT INTO agent_token (ip, port, token, updated_at) VALUES (?, ?, ?, ?)
    ON DUPLICATE KEY UPDATE token = VALUES(token), updated_at = VALUES(updated_at)
"#;

fn last_insert_id(res: &MySqlQueryResult) -> i64 {
    res.last_insert_id() as i64
}

/// MySQL-backed persistence provider.
#[derive(Clone)]
pub struct MySqlPersistence {
    pool: MySqlPool,
}

impl MySqlPersistence {
    /// Wrap an existing, migrated pool.
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| Error::unexpected(format!("failed to connect to cluster store: {}", e)))?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

impl_task_store!(MySqlPersistence);
impl_cluster_store!(MySqlPersistence, sqlx::MySql);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentIdentity, AgentStatus};
    use crate::persistence::{ClusterStore, CreateOutcome, NewDag, NewNode, NewSubTask, TaskStore};
    use crate::task::{MaintenanceScope, TaskFlags};

    macro_rules! skip_if_no_db {
        () => {
            match std::env::var("TEST_OBSHELL_CLUSTER_DATABASE_URL") {
                Ok(url) => url,
                Err(_) => {
                    eprintln!("Skipping test: TEST_OBSHELL_CLUSTER_DATABASE_URL not set");
                    return;
                }
            }
        };
    }

    fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, rand::random::<u32>())
    }

    #[tokio::test]
    async fn test_create_dag_and_conflict() {
        let url = skip_if_no_db!();
        let store = MySqlPersistence::connect(&url).await.unwrap();
        let tenant = unique("tenant");

        let dag = NewDag {
            name: unique("dag"),
            maintenance_type: "TENANT".to_string(),
            maintenance_key: tenant.clone(),
            context: "{}".to_string(),
            trace_id: String::new(),
            nodes: vec![NewNode {
                name: "n".to_string(),
                parallel: true,
                tasks: vec![NewSubTask {
                    type_name: "A".to_string(),
                    name: "A".to_string(),
                    flags: TaskFlags::new(),
                    execute_agent: "127.0.0.1:2886".to_string(),
                    data: "{}".to_string(),
                }],
            }],
        };

        let first = match store.create_dag(&dag, &[]).await.unwrap() {
            CreateOutcome::Created(record) => record,
            other => panic!("expected created, got {:?}", other),
        };
        assert_eq!(store.list_sub_tasks(first.id).await.unwrap().len(), 1);
        assert_eq!(
            MaintenanceScope::from_columns(&first.maintenance_type, &first.maintenance_key).unwrap(),
            MaintenanceScope::Tenant(tenant)
        );

        let second = store.create_dag(&dag, &[]).await.unwrap();
        assert_eq!(second, CreateOutcome::Conflict { holder: first.id });

        let mut done = first.clone();
        done.state = "SUCCEED".to_string();
        store.update_dag(&done).await.unwrap();
    }

    #[tokio::test]
    async fn test_agent_token_upsert() {
        let url = skip_if_no_db!();
        let store = MySqlPersistence::connect(&url).await.unwrap();
        let ip = unique("10.9");

        store
            .insert_agent(&AgentIdentity::single(&ip, 2886, 2881), AgentStatus::Active, "a")
            .await
            .unwrap();
        store.set_agent_token(&ip, 2886, "b").await.unwrap();
        assert_eq!(
            store.get_agent_token(&ip, 2886).await.unwrap().as_deref(),
            Some("b")
        );
        assert!(store.delete_agent(&ip, 2886).await.unwrap());
    }
}
