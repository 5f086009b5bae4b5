// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! States, operators, scopes and identifiers of the task engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// State of a DAG, node or sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    /// Created, not scheduled yet.
    Pending,
    /// Scheduled, waiting for a worker.
    Ready,
    /// Executing.
    Running,
    /// Terminated with an error.
    Failed,
    /// Terminated successfully.
    Succeed,
}

impl TaskState {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Succeed => "SUCCEED",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING" => Self::Pending,
            "READY" => Self::Ready,
            "RUNNING" => Self::Running,
            "FAILED" => Self::Failed,
            "SUCCEED" => Self::Succeed,
            other => return Err(Error::unexpected(format!("unknown task state '{}'", other))),
        })
    }

    /// FAILED or SUCCEED.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Succeed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator driving a DAG, node or sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    /// Normal forward execution.
    Run,
    /// Re-run failed sub-tasks.
    Retry,
    /// Undo completed work, node by node.
    Rollback,
    /// Stop running work.
    Cancel,
    /// Treat failed or waiting work as succeeded.
    Pass,
}

impl Operator {
    /// Persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Retry => "RETRY",
            Self::Rollback => "ROLLBACK",
            Self::Cancel => "CANCEL",
            Self::Pass => "PASS",
        }
    }

    /// Parse the persisted string form (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "RUN" => Self::Run,
            "RETRY" => Self::Retry,
            "ROLLBACK" => Self::Rollback,
            "CANCEL" => Self::Cancel,
            "PASS" => Self::Pass,
            _ => return Err(Error::illegal_argument(format!("operator '{}'", s))),
        })
    }

    /// Operators that move the DAG forward.
    pub fn is_forward(&self) -> bool {
        matches!(self, Self::Run | Self::Retry | Self::Pass)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialisation tag for concurrent DAGs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaintenanceScope {
    /// Cluster-wide exclusion.
    Global,
    /// Exclusion per tenant.
    Tenant(String),
    /// No exclusion.
    UnMaintenance,
}

impl MaintenanceScope {
    /// Persisted type column.
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Global => "GLOBAL",
            Self::Tenant(_) => "TENANT",
            Self::UnMaintenance => "UN_MAINTENANCE",
        }
    }

    /// Persisted key column.
    pub fn key(&self) -> &str {
        match self {
            Self::Tenant(name) => name,
            _ => "",
        }
    }

    /// Rebuild from the persisted columns.
    pub fn from_columns(type_str: &str, key: &str) -> Result<Self> {
        Ok(match type_str {
            "GLOBAL" => Self::Global,
            "TENANT" => Self::Tenant(key.to_string()),
            "UN_MAINTENANCE" => Self::UnMaintenance,
            other => {
                return Err(Error::unexpected(format!(
                    "unknown maintenance type '{}'",
                    other
                )));
            }
        })
    }

    /// Whether two scopes exclude each other.
    pub fn intersects(&self, other: &MaintenanceScope) -> bool {
        match (self, other) {
            (Self::UnMaintenance, _) | (_, Self::UnMaintenance) => false,
            (Self::Global, _) | (_, Self::Global) => true,
            (Self::Tenant(a), Self::Tenant(b)) => a == b,
        }
    }

    /// Whether the scope takes part in exclusion at all.
    pub fn is_maintenance(&self) -> bool {
        !matches!(self, Self::UnMaintenance)
    }
}

impl fmt::Display for MaintenanceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tenant(name) => write!(f, "TENANT({})", name),
            other => f.write_str(other.type_str()),
        }
    }
}

/// Which store holds a DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreScope {
    /// The agent's embedded store.
    Local,
    /// The shared cluster store.
    Cluster,
}

impl StoreScope {
    fn tag(&self) -> char {
        match self {
            Self::Local => '0',
            Self::Cluster => '1',
        }
    }
}

/// Store-qualified row id, rendered as a one-digit store tag followed by
/// the decimal row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenericId {
    /// Store holding the row.
    pub scope: StoreScope,
    /// Row id inside the store.
    pub id: i64,
}

impl GenericId {
    /// A local-store id.
    pub fn local(id: i64) -> Self {
        Self {
            scope: StoreScope::Local,
            id,
        }
    }

    /// A cluster-store id.
    pub fn cluster(id: i64) -> Self {
        Self {
            scope: StoreScope::Cluster,
            id,
        }
    }
}

impl fmt::Display for GenericId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.scope.tag(), self.id)
    }
}

impl FromStr for GenericId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::illegal_argument(format!("id '{}'", s));
        let mut chars = s.chars();
        let scope = match chars.next() {
            Some('0') => StoreScope::Local,
            Some('1') => StoreScope::Cluster,
            _ => return Err(bad()),
        };
        let rest = chars.as_str();
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let id = rest.parse().map_err(|_| bad())?;
        Ok(Self { scope, id })
    }
}

impl Serialize for GenericId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GenericId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Store-qualified sub-task key used by the executor pool.
pub type TaskKey = GenericId;

/// Capability flags of a sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFlags {
    /// Honours the cancel hook.
    pub can_cancel: bool,
    /// Safe to resume after an agent restart.
    pub can_continue: bool,
    /// May be treated as succeeded by PASS.
    pub can_pass: bool,
    /// May be re-run by RETRY.
    pub can_retry: bool,
    /// Implements a meaningful rollback.
    pub can_rollback: bool,
}

impl Default for TaskFlags {
    fn default() -> Self {
        Self {
            can_cancel: false,
            can_continue: false,
            can_pass: false,
            can_retry: true,
            can_rollback: false,
        }
    }
}

impl TaskFlags {
    /// Retryable only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `can_cancel`.
    pub fn cancellable(mut self) -> Self {
        self.can_cancel = true;
        self
    }

    /// Set `can_continue`.
    pub fn continuable(mut self) -> Self {
        self.can_continue = true;
        self
    }

    /// Set `can_pass`.
    pub fn passable(mut self) -> Self {
        self.can_pass = true;
        self
    }

    /// Set `can_rollback`.
    pub fn rollbackable(mut self) -> Self {
        self.can_rollback = true;
        self
    }
}
