// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent identity and role.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::persistence::LocalStore;

/// Network address of an agent, rendered as `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentAddr {
    /// Agent ip.
    pub ip: String,
    /// Agent HTTP port.
    pub port: u16,
}

impl AgentAddr {
    /// Build an address.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Base URL for HTTP calls.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for AgentAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::illegal_argument(format!("agent address '{}'", s)))?;
        let port = port
            .parse()
            .map_err(|_| Error::illegal_argument(format!("agent port '{}'", port)))?;
        if ip.is_empty() {
            return Err(Error::illegal_argument(format!("agent address '{}'", s)));
        }
        Ok(Self::new(ip, port))
    }
}

/// Agent role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    /// Not part of any cluster.
    Single,
    /// Cluster master.
    Master,
    /// Cluster follower.
    Follower,
    /// Cluster member whose role has not been resolved yet.
    ClusterAgent,
    /// Master of a cluster taking over an existing database.
    TakeOverMaster,
    /// Follower of a cluster taking over an existing database.
    TakeOverFollower,
    /// Joining through scale-out.
    ScalingOut,
    /// Leaving through scale-in.
    ScalingIn,
}

impl AgentRole {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Master => "MASTER",
            Self::Follower => "FOLLOWER",
            Self::ClusterAgent => "CLUSTER_AGENT",
            Self::TakeOverMaster => "TAKE_OVER_MASTER",
            Self::TakeOverFollower => "TAKE_OVER_FOLLOWER",
            Self::ScalingOut => "SCALING_OUT",
            Self::ScalingIn => "SCALING_IN",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "SINGLE" => Self::Single,
            "MASTER" => Self::Master,
            "FOLLOWER" => Self::Follower,
            "CLUSTER_AGENT" => Self::ClusterAgent,
            "TAKE_OVER_MASTER" => Self::TakeOverMaster,
            "TAKE_OVER_FOLLOWER" => Self::TakeOverFollower,
            "SCALING_OUT" => Self::ScalingOut,
            "SCALING_IN" => Self::ScalingIn,
            other => return Err(Error::illegal_argument(format!("agent role '{}'", other))),
        })
    }

    /// Roles taking part in a take-over.
    pub fn is_take_over(&self) -> bool {
        matches!(self, Self::TakeOverMaster | Self::TakeOverFollower)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness recorded in the cluster store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Serving requests.
    Active,
    /// Registered but not serving.
    Inactive,
}

impl AgentStatus {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
        }
    }

    /// Parse the persisted string form; anything unknown is inactive.
    pub fn parse(s: &str) -> Self {
        if s == "ACTIVE" {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// Full identity of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Agent ip.
    pub ip: String,
    /// Agent HTTP port.
    pub port: u16,
    /// Database SQL port.
    pub sql_port: u16,
    /// Database zone, empty before join.
    #[serde(default)]
    pub zone: String,
    /// Agent version.
    pub version: String,
    /// Current role.
    pub role: AgentRole,
}

impl AgentIdentity {
    /// A fresh SINGLE identity.
    pub fn single(ip: impl Into<String>, port: u16, sql_port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            sql_port,
            zone: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            role: AgentRole::Single,
        }
    }

    /// The `ip:port` address.
    pub fn addr(&self) -> AgentAddr {
        AgentAddr::new(self.ip.clone(), self.port)
    }

    /// Whether `addr` designates this agent.
    pub fn is(&self, addr: &AgentAddr) -> bool {
        self.ip == addr.ip && self.port == addr.port
    }
}

/// The process-wide identity of this agent, persisted on every change.
#[derive(Clone)]
pub struct AgentState {
    identity: Arc<RwLock<AgentIdentity>>,
    local: Arc<dyn LocalStore>,
}

impl fmt::Debug for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentState")
            .field("identity", &*self.identity.read())
            .finish_non_exhaustive()
    }
}

impl AgentState {
    /// Wrap an identity already persisted in `local`.
    pub fn new(identity: AgentIdentity, local: Arc<dyn LocalStore>) -> Self {
        Self {
            identity: Arc::new(RwLock::new(identity)),
            local,
        }
    }

    /// Snapshot of the identity.
    pub fn get(&self) -> AgentIdentity {
        self.identity.read().clone()
    }

    /// This agent's address.
    pub fn addr(&self) -> AgentAddr {
        self.identity.read().addr()
    }

    /// Current role.
    pub fn role(&self) -> AgentRole {
        self.identity.read().role
    }

    /// Apply `change`, persist, then publish the new identity.
    pub async fn update<F>(&self, change: F) -> Result<AgentIdentity>
    where
        F: FnOnce(&mut AgentIdentity),
    {
        let mut next = self.get();
        change(&mut next);
        self.local.save_identity(&next).await?;
        *self.identity.write() = next.clone();
        info!(role = %next.role, zone = %next.zone, "Agent identity updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_parse_and_display() {
        let addr: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        assert_eq!(addr, AgentAddr::new("10.0.0.1", 2886));
        assert_eq!(addr.to_string(), "10.0.0.1:2886");
        assert!("10.0.0.1".parse::<AgentAddr>().is_err());
        assert!(":2886".parse::<AgentAddr>().is_err());
        assert!("10.0.0.1:port".parse::<AgentAddr>().is_err());
    }

    #[test]
    fn test_addr_ordering_is_lexicographic_then_port() {
        let mut addrs = vec![
            AgentAddr::new("10.0.0.2", 2886),
            AgentAddr::new("10.0.0.1", 2887),
            AgentAddr::new("10.0.0.1", 2886),
        ];
        addrs.sort();
        assert_eq!(addrs[0], AgentAddr::new("10.0.0.1", 2886));
        assert_eq!(addrs[2], AgentAddr::new("10.0.0.2", 2886));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [
            AgentRole::Single,
            AgentRole::Master,
            AgentRole::Follower,
            AgentRole::ClusterAgent,
            AgentRole::TakeOverMaster,
            AgentRole::TakeOverFollower,
            AgentRole::ScalingOut,
            AgentRole::ScalingIn,
        ] {
            assert_eq!(AgentRole::parse(role.as_str()).unwrap(), role);
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{}\"", role.as_str()));
        }
        assert!(AgentRole::parse("BOSS").is_err());
    }

    #[tokio::test]
    async fn test_state_update_persists() {
        use crate::persistence::SqlitePersistence;

        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let state = AgentState::new(AgentIdentity::single("10.0.0.1", 2886, 2881), local.clone());

        state
            .update(|id| {
                id.role = AgentRole::Follower;
                id.zone = "z1".to_string();
            })
            .await
            .unwrap();

        assert_eq!(state.role(), AgentRole::Follower);
        let stored = local.get_identity().await.unwrap().unwrap();
        assert_eq!(stored.zone, "z1");
    }
}
