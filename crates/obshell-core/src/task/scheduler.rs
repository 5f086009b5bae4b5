// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG scheduler.
//!
//! Periodically advances live DAGs and offers READY sub-tasks assigned to
//! this agent to the executor pool. Local DAGs advance on every agent;
//! cluster DAGs only on the maintainer, which also fails cluster sub-tasks
//! stranded on agents that are no longer active.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::agent::AgentStatus;
use crate::error::Result;
use crate::persistence::DagRecord;

use super::service::TaskService;
use super::types::{GenericId, StoreScope, TaskState};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// DAG scheduler that runs as a background task.
pub struct Scheduler {
    service: TaskService,
    config: SchedulerConfig,
    maintainer: bool,
    maintainer_events: Option<mpsc::Receiver<bool>>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler. It drives cluster DAGs only once told it is the
    /// maintainer.
    pub fn new(service: TaskService, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            maintainer: false,
            maintainer_events: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Initial maintainer flag.
    pub fn maintainer(mut self, maintainer: bool) -> Self {
        self.maintainer = maintainer;
        self
    }

    /// Follow maintainer changes published by the coordinator.
    pub fn with_maintainer_events(mut self, events: mpsc::Receiver<bool>) -> Self {
        self.maintainer_events = Some(events);
        self
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            maintainer = self.maintainer,
            "DAG scheduler started"
        );
        let kick = self.service.deps().kick.clone();

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("DAG scheduler shutting down");
                    break;
                }
                event = next_event(&mut self.maintainer_events) => {
                    if event != self.maintainer {
                        info!(maintainer = event, "Maintainer role changed");
                    }
                    self.maintainer = event;
                    continue;
                }
                _ = kick.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }
        }
    }

    /// One scheduling pass.
    pub async fn tick(&self) -> Result<()> {
        let stores = &self.service.deps().stores;

        for scope in [StoreScope::Local, StoreScope::Cluster] {
            if scope == StoreScope::Cluster && !self.maintainer {
                continue;
            }
            let dags = match stores.tasks(scope).list_active_dags().await {
                Ok(dags) => dags,
                Err(e) if scope == StoreScope::Cluster => {
                    warn!(error = %e, "Cluster store unavailable, skipping cluster DAGs");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut agents = None;
            for dag in dags {
                let id = GenericId { scope, id: dag.id };
                if scope == StoreScope::Cluster {
                    if agents.is_none() {
                        agents = Some(self.agent_statuses().await?);
                    }
                    if let Some(agents) = &agents
                        && let Err(e) = self.fail_stranded(&dag, agents).await
                    {
                        warn!(dag_id = %id, error = %e, "Failed to check sub-task agents");
                    }
                }
                if let Err(e) = self.service.advance_dag(id).await {
                    error!(dag_id = %id, error = %e, "Failed to advance DAG");
                }
            }
        }

        self.offer_ready().await
    }

    async fn agent_statuses(&self) -> Result<HashMap<String, AgentStatus>> {
        let agents = self.service.deps().stores.cluster.list_agents().await?;
        Ok(agents
            .into_iter()
            .map(|a| (format!("{}:{}", a.ip, a.port), a.agent_status()))
            .collect())
    }

    /// Fail READY or RUNNING sub-tasks whose agent is gone or inactive.
    async fn fail_stranded(&self, dag: &DagRecord, agents: &HashMap<String, AgentStatus>) -> Result<()> {
        let me = self.service.deps().agent.addr().to_string();
        let store = self.service.deps().stores.tasks(StoreScope::Cluster);
        for mut task in store.list_sub_tasks(dag.id).await? {
            if task.execute_agent == me
                || !matches!(task.task_state()?, TaskState::Ready | TaskState::Running)
            {
                continue;
            }
            if agents.get(&task.execute_agent) == Some(&AgentStatus::Active) {
                continue;
            }
            warn!(
                sub_task_id = task.id,
                agent = %task.execute_agent,
                "Failing sub-task of inactive agent"
            );
            task.state = TaskState::Failed.to_string();
            task.end_at = Some(Utc::now());
            let line = format!("agent {} is not active", task.execute_agent);
            store.update_sub_task(&task, &[line]).await?;
        }
        Ok(())
    }

    /// Offer READY sub-tasks assigned to this agent to the pool.
    async fn offer_ready(&self) -> Result<()> {
        let me = self.service.deps().agent.addr().to_string();
        for scope in [StoreScope::Local, StoreScope::Cluster] {
            let tasks = match self
                .service
                .deps()
                .stores
                .tasks(scope)
                .list_runnable_sub_tasks(&me)
                .await
            {
                Ok(tasks) => tasks,
                Err(e) if scope == StoreScope::Cluster => {
                    debug!(error = %e, "Cluster store unavailable, skipping ready poll");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for task in tasks
                .into_iter()
                .filter(|t| t.state == TaskState::Ready.as_str())
            {
                let key = GenericId { scope, id: task.id };
                if self.service.pool().is_running(key) {
                    continue;
                }
                if let Err(e) = self.service.pool().add_task(key) {
                    debug!(sub_task = %key, error = %e, "Could not offer sub-task");
                    break;
                }
            }
        }
        Ok(())
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<bool>>) -> bool {
    match events {
        Some(rx) => match rx.recv().await {
            Some(flag) => flag,
            None => {
                *events = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
