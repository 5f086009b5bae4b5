// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convergence of locally mirrored cluster state.
//!
//! Cluster sub-task transitions written while the cluster store was
//! unreachable land in the local store (see [`EngineDeps::persist`]). The
//! synchroniser pushes them back once per tick while the coordinator is not
//! faulty:
//!
//! 1. log rows after the last synced id, inserted directly into the cluster
//!    store, or shipped to the maintainer over `POST /rpc/v1/task/log` when
//!    the direct insert fails;
//! 2. mirror rows, applied to the cluster sub-task unless it moved on.
//!
//! Log rows that could not be shipped wait in a bounded in-memory retry
//! list. The persisted cursor never passes an unshipped row, so a restart
//! resumes from the first row still owed.
//!
//! [`EngineDeps::persist`]: crate::task::EngineDeps::persist

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::agent::AgentState;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::persistence::{ShippedLog, Stores, SubTaskLogRecord};
use crate::remote::{RpcClient, paths};

/// Local config key of the last shipped log id.
pub const LAST_SYNCED_LOG_KEY: &str = "task_log_last_synced_id";

/// Synchroniser configuration.
#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    /// Tick period.
    pub poll_interval: Duration,
    /// Batch size and retry-list bound.
    pub buffer: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            buffer: 10_000,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Log rows that reached the cluster store.
    pub logs_shipped: usize,
    /// Log rows waiting in the retry list.
    pub logs_pending: usize,
    /// Mirror rows applied.
    pub mirrors_applied: usize,
}

/// Background synchroniser.
pub struct Synchronizer {
    stores: Stores,
    coordinator: Coordinator,
    client: RpcClient,
    agent: AgentState,
    config: SynchronizerConfig,
    cursor: Option<i64>,
    retry: VecDeque<(i64, ShippedLog)>,
    cluster_down: bool,
    shutdown: Arc<Notify>,
}

impl Synchronizer {
    /// Create a synchroniser.
    pub fn new(
        stores: Stores,
        coordinator: Coordinator,
        client: RpcClient,
        agent: AgentState,
        config: SynchronizerConfig,
    ) -> Self {
        Self {
            stores,
            coordinator,
            client,
            agent,
            config,
            cursor: None,
            retry: VecDeque::new(),
            cluster_down: false,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the synchroniser loop.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            buffer = self.config.buffer,
            "Synchronizer started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(pending = self.retry.len(), "Synchronizer shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            match self.sync_once().await {
                Ok(report) if report != SyncReport::default() => {
                    debug!(
                        logs_shipped = report.logs_shipped,
                        logs_pending = report.logs_pending,
                        mirrors_applied = report.mirrors_applied,
                        "Synchronizer pass"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Synchronizer pass failed"),
            }
        }
    }

    /// One pass. Does nothing while the coordinator is faulty.
    pub async fn sync_once(&mut self) -> Result<SyncReport> {
        if self.coordinator.is_faulty() {
            return Ok(SyncReport::default());
        }
        let mut report = SyncReport::default();
        report.logs_shipped = self.sync_logs().await?;
        report.logs_pending = self.retry.len();
        report.mirrors_applied = self.sync_mirrors().await?;
        Ok(report)
    }

    async fn cursor(&mut self) -> Result<i64> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }
        let stored = self
            .stores
            .local
            .get_config(LAST_SYNCED_LOG_KEY)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        self.cursor = Some(stored);
        Ok(stored)
    }

    async fn sync_logs(&mut self) -> Result<usize> {
        let cursor = self.cursor().await?;
        let room = self.config.buffer.saturating_sub(self.retry.len()).max(1);
        let fresh = self
            .stores
            .local
            .list_unsynced_logs(cursor, room as i64)
            .await?;
        if let Some(last) = fresh.last() {
            self.cursor = Some(last.id);
        }

        let batch: Vec<(i64, ShippedLog)> = self
            .retry
            .drain(..)
            .chain(fresh.into_iter().map(|r| (r.id, shipped(r))))
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let logs: Vec<ShippedLog> = batch.iter().map(|(_, l)| l.clone()).collect();
        if let Err(e) = self.ship(&logs).await {
            warn!(error = %e, count = batch.len(), "Log shipment failed, keeping for retry");
            self.retry.extend(batch);
            while self.retry.len() > self.config.buffer {
                if let Some((id, _)) = self.retry.pop_front() {
                    warn!(log_id = id, "Retry list full, dropping oldest log row");
                }
            }
            self.save_cursor().await?;
            return Ok(0);
        }

        let ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();
        self.stores.local.mark_logs_synced(&ids).await?;
        self.save_cursor().await?;
        Ok(ids.len())
    }

    /// The persisted cursor stops right before the oldest row still owed.
    async fn save_cursor(&self) -> Result<()> {
        let cursor = match self.retry.iter().map(|(id, _)| *id).min() {
            Some(oldest) => oldest - 1,
            None => self.cursor.unwrap_or(0),
        };
        self.stores
            .local
            .set_config(LAST_SYNCED_LOG_KEY, &cursor.to_string())
            .await
    }

    async fn ship(&self, logs: &[ShippedLog]) -> Result<()> {
        match self.stores.cluster.insert_shipped_logs(logs).await {
            Ok(()) => Ok(()),
            Err(direct) => {
                let maintainer = self.coordinator.require_maintainer()?;
                if maintainer.is(&self.agent.addr()) {
                    return Err(direct);
                }
                debug!(error = %direct, maintainer = %maintainer.addr(), "Direct insert failed, shipping to maintainer");
                self.client
                    .post::<_, serde_json::Value>(&maintainer.addr(), paths::TASK_LOG, &logs)
                    .await?;
                Ok(())
            }
        }
    }

    async fn sync_mirrors(&mut self) -> Result<usize> {
        let mirrors = self
            .stores
            .local
            .list_unsynced_mirrors(self.config.buffer as i64)
            .await?;
        let mut applied = 0;
        for mirror in mirrors {
            match self.stores.cluster.apply_mirror(&mirror).await {
                Ok(moved) => {
                    if !moved {
                        debug!(sub_task_id = mirror.sub_task_id, "Cluster sub-task moved on, mirror dropped");
                    }
                    self.stores
                        .local
                        .mark_mirror_synced(mirror.sub_task_id, mirror.updated_at)
                        .await?;
                    applied += usize::from(moved);
                    if self.cluster_down {
                        self.cluster_down = false;
                        info!("Cluster store reachable again");
                        self.coordinator.request_publish();
                    }
                }
                Err(e) => {
                    if !self.cluster_down {
                        warn!(error = %e, "Cluster store unreachable, mirrors kept locally");
                    }
                    self.cluster_down = true;
                    break;
                }
            }
        }
        Ok(applied)
    }
}

fn shipped(record: SubTaskLogRecord) -> ShippedLog {
    ShippedLog {
        sub_task_id: record.sub_task_id,
        execute_times: record.execute_times,
        content: record.content,
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentIdentity;
    use crate::coordinator::PeerProbe;
    use crate::persistence::{LocalStore, SqlitePersistence, SubTaskRecord, TaskStore};
    use crate::task::TaskState;
    use async_trait::async_trait;

    struct AllAlive;

    #[async_trait]
    impl PeerProbe for AllAlive {
        async fn is_alive(&self, _: &crate::agent::AgentAddr) -> bool {
            true
        }
    }

    async fn setup() -> (Synchronizer, Arc<SqlitePersistence>, Arc<SqlitePersistence>) {
        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let cluster = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let identity = AgentIdentity::single("127.0.0.1", 2886, 2881);
        local.save_identity(&identity).await.unwrap();
        let agent = AgentState::new(identity, local.clone());
        let coordinator = Coordinator::new(
            agent.clone(),
            cluster.clone(),
            Arc::new(AllAlive),
            Duration::from_secs(1),
        );
        coordinator.evaluate().await.unwrap();
        let client = RpcClient::new(cluster.clone(), Duration::from_secs(10)).unwrap();
        let stores = Stores::sqlite(local.clone(), cluster.clone());
        let sync = Synchronizer::new(stores, coordinator, client, agent, SynchronizerConfig::default());
        (sync, local, cluster)
    }

    fn record(id: i64) -> SubTaskRecord {
        SubTaskRecord {
            id,
            dag_id: 1,
            node_id: 1,
            seq: 0,
            type_name: "Step".to_string(),
            name: "step".to_string(),
            state: TaskState::Succeed.to_string(),
            operator: "RUN".to_string(),
            can_cancel: false,
            can_continue: false,
            can_pass: false,
            can_retry: true,
            can_rollback: false,
            execute_times: 1,
            execute_agent: "127.0.0.1:2886".to_string(),
            data: "{}".to_string(),
            additional_data: "{}".to_string(),
            created_at: chrono::Utc::now(),
            started_at: None,
            end_at: None,
        }
    }

    #[tokio::test]
    async fn test_ships_mirrored_logs_and_resumes_from_cursor() {
        let (mut sync, local, cluster) = setup().await;
        local
            .save_mirror(&record(42), &["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        let report = sync.sync_once().await.unwrap();
        assert_eq!(report.logs_shipped, 2);
        assert_eq!(report.logs_pending, 0);

        let shipped: Vec<String> = cluster
            .list_logs(42)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.content)
            .collect();
        assert_eq!(shipped, vec!["first", "second"]);
        assert!(local.list_unsynced_logs(0, 10).await.unwrap().is_empty());
        assert!(local.list_unsynced_mirrors(10).await.unwrap().is_empty());

        let cursor = local.get_config(LAST_SYNCED_LOG_KEY).await.unwrap().unwrap();
        assert_ne!(cursor, "0");

        let report = sync.sync_once().await.unwrap();
        assert_eq!(report, SyncReport::default());
    }
}
