// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Maintainer election.
//!
//! The coordinator re-evaluates, once per interval, which agent of the
//! cluster maintains globally-scoped DAGs, and publishes a boolean event
//! ("this agent is the maintainer") to every subscriber whenever the answer
//! changes.
//!
//! Election rules, first match wins:
//!
//! 1. A SINGLE agent maintains itself.
//! 2. A TAKE_OVER_MASTER maintains the cluster it is taking over.
//! 3. An ACTIVE, reachable MASTER is the maintainer.
//! 4. Otherwise the lowest `(ip, port)` FOLLOWER that is ACTIVE and reachable.
//!
//! When no agent qualifies the coordinator is *faulty* and nobody maintains.
//! The maintainer also writes the observed liveness of every agent back to
//! the cluster store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::agent::{AgentAddr, AgentIdentity, AgentRole, AgentState, AgentStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::persistence::ClusterStore;

const SUBSCRIBER_CAPACITY: usize = 16;

/// Liveness check against a peer agent.
#[async_trait]
pub trait PeerProbe: Send + Sync {
    /// Whether the agent at `addr` answers.
    async fn is_alive(&self, addr: &AgentAddr) -> bool;
}

/// An agent considered for election.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Identity as registered.
    pub identity: AgentIdentity,
    /// Status recorded in the cluster store.
    pub status: AgentStatus,
    /// Whether the agent answered the last probe.
    pub alive: bool,
}

impl Candidate {
    fn eligible(&self) -> bool {
        self.alive && self.status == AgentStatus::Active
    }
}

/// Pick the maintainer among `candidates` as seen from `me`.
pub fn elect(me: &AgentIdentity, candidates: &[Candidate]) -> Option<AgentIdentity> {
    if me.role == AgentRole::Single {
        return Some(me.clone());
    }
    if me.role == AgentRole::TakeOverMaster {
        return Some(me.clone());
    }
    if let Some(c) = candidates
        .iter()
        .find(|c| c.identity.role == AgentRole::TakeOverMaster)
    {
        return Some(c.identity.clone());
    }
    if let Some(c) = candidates
        .iter()
        .find(|c| c.identity.role == AgentRole::Master && c.eligible())
    {
        return Some(c.identity.clone());
    }
    candidates
        .iter()
        .filter(|c| c.identity.role == AgentRole::Follower && c.eligible())
        .min_by(|a, b| a.identity.addr().cmp(&b.identity.addr()))
        .map(|c| c.identity.clone())
}

#[derive(Debug, Default)]
struct Election {
    maintainer: Option<AgentIdentity>,
    faulty: bool,
}

struct Inner {
    agent: AgentState,
    cluster: Arc<dyn ClusterStore>,
    probe: Arc<dyn PeerProbe>,
    interval: Duration,
    election: RwLock<Election>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<bool>>>,
    publish_requested: Notify,
    shutdown: Arc<Notify>,
}

/// Maintainer coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let election = self.inner.election.read();
        f.debug_struct("Coordinator")
            .field("maintainer", &election.maintainer)
            .field("faulty", &election.faulty)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator re-evaluating every `interval`.
    pub fn new(
        agent: AgentState,
        cluster: Arc<dyn ClusterStore>,
        probe: Arc<dyn PeerProbe>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                agent,
                cluster,
                probe,
                interval,
                election: RwLock::new(Election::default()),
                subscribers: Mutex::new(HashMap::new()),
                publish_requested: Notify::new(),
                shutdown: Arc::new(Notify::new()),
            }),
        }
    }

    /// Current maintainer, if any.
    pub fn maintainer(&self) -> Option<AgentIdentity> {
        self.inner.election.read().maintainer.clone()
    }

    /// Current maintainer, or `AGENT_MAINTAINER_NOT_ACTIVE`.
    pub fn require_maintainer(&self) -> Result<AgentIdentity> {
        self.maintainer()
            .ok_or_else(|| Error::new(ErrorKind::AgentMaintainerNotActive))
    }

    /// Whether this agent is the maintainer.
    pub fn is_maintainer(&self) -> bool {
        let me = self.inner.agent.addr();
        self.inner
            .election
            .read()
            .maintainer
            .as_ref()
            .is_some_and(|m| m.is(&me))
    }

    /// Whether the last evaluation found no eligible maintainer.
    pub fn is_faulty(&self) -> bool {
        self.inner.election.read().faulty
    }

    /// Register a subscriber under `key`, replacing any previous one. The
    /// current maintainer flag is delivered immediately.
    pub fn subscribe(&self, key: impl Into<String>) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let _ = tx.try_send(self.is_maintainer());
        self.inner.subscribers.lock().insert(key.into(), tx);
        rx
    }

    /// Drop the subscriber under `key`, closing its channel.
    pub fn unsubscribe(&self, key: &str) {
        self.inner.subscribers.lock().remove(key);
    }

    /// Send the current maintainer flag to every subscriber without blocking.
    pub fn publish(&self) {
        let flag = self.is_maintainer();
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|key, tx| match tx.try_send(flag) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(subscriber = %key, "Subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Ask the running loop to re-evaluate and publish now.
    pub fn request_publish(&self) {
        self.inner.publish_requested.notify_one();
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.inner.shutdown.clone()
    }

    /// Re-evaluate the maintainer; publishes when the outcome changed.
    pub async fn evaluate(&self) -> Result<Option<AgentIdentity>> {
        let me = self.inner.agent.get();
        let elected = if me.role == AgentRole::Single {
            Some(me.clone())
        } else {
            match self.candidates(&me).await {
                Ok(candidates) => {
                    let elected = elect(&me, &candidates);
                    if elected.as_ref().is_some_and(|m| m.is(&me.addr())) {
                        self.reconcile_status(&candidates).await;
                    }
                    elected
                }
                Err(e) => {
                    warn!(error = %e, "Cannot read agents, coordinator is faulty");
                    None
                }
            }
        };

        let changed = {
            let mut election = self.inner.election.write();
            let faulty = elected.is_none();
            let changed = election.maintainer != elected || election.faulty != faulty;
            election.maintainer = elected.clone();
            election.faulty = faulty;
            changed
        };
        if changed {
            match &elected {
                Some(m) => info!(maintainer = %m.addr(), role = %m.role, "Maintainer elected"),
                None => warn!("No eligible maintainer"),
            }
            self.publish();
        }
        Ok(elected)
    }

    async fn candidates(&self, me: &AgentIdentity) -> Result<Vec<Candidate>> {
        let records = self.inner.cluster.list_agents().await?;
        let mut known = Vec::with_capacity(records.len());
        for record in &records {
            match record.identity() {
                Ok(identity) => known.push((identity, record.agent_status())),
                Err(e) => warn!(ip = %record.ip, port = record.port, error = %e, "Skipping malformed agent row"),
            }
        }
        if !known.iter().any(|(identity, _)| identity.is(&me.addr())) {
            known.push((me.clone(), AgentStatus::Active));
        }

        let probes = known.iter().map(|(identity, _)| {
            let addr = identity.addr();
            let is_me = identity.is(&me.addr());
            let probe = self.inner.probe.clone();
            async move { is_me || probe.is_alive(&addr).await }
        });
        let alive = join_all(probes).await;

        Ok(known
            .into_iter()
            .zip(alive)
            .map(|((identity, status), alive)| Candidate {
                identity,
                status,
                alive,
            })
            .collect())
    }

    /// Write observed liveness back to the cluster store.
    async fn reconcile_status(&self, candidates: &[Candidate]) {
        for c in candidates {
            let observed = if c.alive {
                AgentStatus::Active
            } else {
                AgentStatus::Inactive
            };
            if observed == c.status {
                continue;
            }
            info!(agent = %c.identity.addr(), status = observed.as_str(), "Agent status changed");
            if let Err(e) = self
                .inner
                .cluster
                .set_agent_status(&c.identity.ip, c.identity.port, observed)
                .await
            {
                warn!(agent = %c.identity.addr(), error = %e, "Failed to record agent status");
            }
        }
    }

    /// Run the election loop.
    pub async fn run(self) {
        info!(
            interval_ms = self.inner.interval.as_millis() as u64,
            "Coordinator started"
        );
        if let Err(e) = self.evaluate().await {
            warn!(error = %e, "Initial election failed");
        }

        loop {
            let forced = tokio::select! {
                _ = self.inner.shutdown.notified() => {
                    info!("Coordinator shutting down");
                    break;
                }
                _ = self.inner.publish_requested.notified() => true,
                _ = tokio::time::sleep(self.inner.interval) => false,
            };
            if let Err(e) = self.evaluate().await {
                warn!(error = %e, "Election failed");
            }
            if forced {
                self.publish();
            }
        }
        self.inner.subscribers.lock().clear();
    }
}
