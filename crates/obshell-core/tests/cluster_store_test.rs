// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster DAGs and credentials against a MySQL cluster store.
//!
//! Skipped unless `TEST_OBSHELL_CLUSTER_DATABASE_URL` is set.

mod common;

use std::sync::Arc;

use common::*;
use obshell_core::agent::AgentState;
use obshell_core::credential::{CreateCredential, CredentialService, CredentialTarget};
use obshell_core::persistence::{MySqlPersistence, SqlitePersistence, Stores};
use obshell_core::task::{
    EngineDeps, ExecutorConfig, ExecutorPool, MaintenanceScope, NodeTemplate, StoreScope,
    TaskContext, TaskService, TaskState, Template,
};

async fn cluster() -> Arc<MySqlPersistence> {
    let url = std::env::var("TEST_OBSHELL_CLUSTER_DATABASE_URL").unwrap();
    Arc::new(MySqlPersistence::connect(&url).await.expect("Failed to connect to cluster store"))
}

#[tokio::test]
async fn test_cluster_dag_runs_on_mysql() {
    skip_if_no_db!();

    let counters = Arc::new(Counters::default());
    let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let stores = Stores::mysql(local.clone(), cluster().await);
    let agent = AgentState::new(identity(), local);
    let deps = EngineDeps::new(stores, registry(&counters), agent);
    let pool = ExecutorPool::new(deps.clone(), ExecutorConfig::default());
    let service = TaskService::new(deps, pool);
    let _workers = service.pool().start();

    let tenant = format!("tenant-{}", rand::random::<u32>());
    let template = Template::builder("cluster steps")
        .scope(MaintenanceScope::Tenant(tenant.clone()))
        .cluster()
        .node(NodeTemplate::single("Step"))
        .node(NodeTemplate::single("Step"))
        .build()
        .unwrap();
    let dag = service
        .create_dag_by_template(&template, &TaskContext::new(), &[], "")
        .await
        .unwrap();
    assert_eq!(dag.id.scope, StoreScope::Cluster);

    let err = service
        .create_dag_by_template(&template, &TaskContext::new(), &[], "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), obshell_core::ErrorKind::TaskMaintenanceConflict);

    let detail = loop {
        service.advance_dag(dag.id).await.unwrap();
        let detail = service.get_dag(dag.id, true).await.unwrap();
        if detail.is_finished() {
            break detail;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };
    assert_eq!(detail.state, TaskState::Succeed);
    assert_eq!(counters.executed(), 2);
    assert_eq!(detail.nodes[1].sub_tasks[0].logs, vec!["step done".to_string()]);

    let holder = service
        .get_maintenance_dag(&MaintenanceScope::Tenant(tenant))
        .await
        .unwrap();
    assert!(holder.is_none());
    service.pool().shutdown();
}

#[tokio::test]
async fn test_credentials_survive_key_rotation_on_mysql() {
    skip_if_no_db!();

    let service = CredentialService::new(cluster().await);
    let name = format!("host-{}", rand::random::<u32>());
    let created = service
        .create(CreateCredential {
            target_type: "HOST".to_string(),
            name: name.clone(),
            description: "integration".to_string(),
            targets: vec![CredentialTarget {
                ip: "10.0.0.1".to_string(),
                port: 22,
            }],
            username: "admin".to_string(),
            auth_type: "PASSWORD".to_string(),
            passphrase: "s3cret".to_string(),
        })
        .await
        .unwrap();

    service
        .rotate_secret_key(obshell_security::SecretKey::generate())
        .await
        .unwrap();
    assert_eq!(service.passphrase(created.id).await.unwrap(), "s3cret");

    service.delete(created.id).await.unwrap();
    assert!(
        service
            .list(Some("HOST"))
            .await
            .unwrap()
            .iter()
            .all(|c| c.name != name)
    );
}
