// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for obshell-core integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use obshell_core::agent::{AgentIdentity, AgentState};
use obshell_core::error::Error;
use obshell_core::persistence::{LocalStore, SqlitePersistence, Stores};
use obshell_core::task::{
    DagDetail, EngineDeps, Executable, ExecutionEnv, ExecutorConfig, ExecutorPool, GenericId,
    TaskError, TaskFlags, TaskRegistry, TaskResult, TaskService,
};

/// Counts forward and backward runs.
#[derive(Debug, Default)]
pub struct Counters {
    pub executed: AtomicUsize,
    pub rolled_back: AtomicUsize,
}

impl Counters {
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }
}

/// Succeeds and records both directions.
#[derive(Debug)]
pub struct Step(pub Arc<Counters>);

#[async_trait]
impl Executable for Step {
    async fn execute(&self, env: &mut ExecutionEnv) -> TaskResult {
        self.0.executed.fetch_add(1, Ordering::SeqCst);
        env.log("step done");
        Ok(())
    }

    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        self.0.rolled_back.fetch_add(1, Ordering::SeqCst);
        env.log("step undone");
        Ok(())
    }
}

/// Always fails forward; rollback succeeds.
#[derive(Debug)]
pub struct Broken;

#[async_trait]
impl Executable for Broken {
    async fn execute(&self, _env: &mut ExecutionEnv) -> TaskResult {
        Err(TaskError::Failed(Error::unexpected("disk full")))
    }

    async fn rollback(&self, env: &mut ExecutionEnv) -> TaskResult {
        env.log("nothing to undo");
        Ok(())
    }
}

pub fn registry(counters: &Arc<Counters>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    let c = counters.clone();
    registry.register("Step", TaskFlags::new().rollbackable(), move || Step(c.clone()));
    registry.register("Broken", TaskFlags::new().rollbackable(), || Broken);
    registry
}

pub fn identity() -> AgentIdentity {
    AgentIdentity::single("127.0.0.1", 2886, 2881)
}

/// A task service over an on-disk store under `home`, as an agent would
/// open it after a restart.
pub async fn open_service(home: &Path, counters: &Arc<Counters>) -> TaskService {
    let local = Arc::new(
        SqlitePersistence::from_path(home.join("run").join("obshell.db"))
            .await
            .expect("Failed to open local store"),
    );
    let identity = match local.get_identity().await.unwrap() {
        Some(identity) => identity,
        None => {
            local.save_identity(&identity()).await.unwrap();
            identity()
        }
    };
    let cluster = Arc::new(
        SqlitePersistence::from_path(home.join("run").join("cluster.db"))
            .await
            .expect("Failed to open cluster store"),
    );
    let stores = Stores::sqlite(local.clone(), cluster);
    let agent = AgentState::new(identity, local);
    let deps = EngineDeps::new(stores, registry(counters), agent);
    let pool = ExecutorPool::new(deps.clone(), ExecutorConfig::default());
    TaskService::new(deps, pool)
}

/// Poll `id` until it is terminal.
pub async fn wait_finished(service: &TaskService, id: GenericId) -> DagDetail {
    for _ in 0..250 {
        let detail = service.get_dag(id, true).await.expect("Failed to read dag");
        if detail.is_finished() {
            return detail;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("dag {} did not finish", id);
}

/// Skip a test when no MySQL cluster store is available.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_OBSHELL_CLUSTER_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_OBSHELL_CLUSTER_DATABASE_URL not set");
            return;
        }
    };
}
