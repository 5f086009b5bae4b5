// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value context attached to a DAG.
//!
//! | Section | Written by | Lifetime |
//! |---------|------------|----------|
//! | `params` | the handler creating the DAG | fixed at creation |
//! | `agent_data` | handler or tasks, keyed by `ip:port` | whole DAG |
//! | `data` | tasks | whole DAG |

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentAddr;
use crate::error::{Error, ErrorKind, Result};

/// Context key carrying a sub-task timeout in seconds.
pub const TIMEOUT_KEY: &str = "timeout";

/// Default sub-task timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// DAG context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskContext {
    /// Global parameters.
    pub params: BTreeMap<String, Value>,
    /// Data per agent, keyed by `ip:port`.
    pub agent_data: BTreeMap<String, BTreeMap<String, Value>>,
    /// Shared data.
    pub data: BTreeMap<String, Value>,
}

impl TaskContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style parameter setter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.set_param(key, value)?;
        Ok(self)
    }

    /// Set a global parameter.
    pub fn set_param(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.params.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read a required parameter.
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .params
            .get(key)
            .ok_or_else(|| Error::with_args(ErrorKind::TaskParamNotSet, [key]))?;
        decode(key, value)
    }

    /// Read an optional parameter.
    pub fn param_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.params.get(key).map(|v| decode(key, v)).transpose()
    }

    /// Set shared data.
    pub fn set_data(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read optional shared data.
    pub fn data<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.data.get(key).map(|v| decode(key, v)).transpose()
    }

    /// Set data for one agent.
    pub fn set_agent_data(
        &mut self,
        agent: &AgentAddr,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<()> {
        self.agent_data
            .entry(agent.to_string())
            .or_default()
            .insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read optional data for one agent.
    pub fn agent_data<T: DeserializeOwned>(&self, agent: &AgentAddr, key: &str) -> Result<Option<T>> {
        self.agent_data
            .get(&agent.to_string())
            .and_then(|m| m.get(key))
            .map(|v| decode(key, v))
            .transpose()
    }

    /// Merge shared data written by a task; agent data merges per key.
    pub fn merge_written(&mut self, written: &TaskContext) {
        for (k, v) in &written.data {
            self.data.insert(k.clone(), v.clone());
        }
        for (agent, values) in &written.agent_data {
            let entry = self.agent_data.entry(agent.clone()).or_default();
            for (k, v) in values {
                entry.insert(k.clone(), v.clone());
            }
        }
    }

    /// Sub-task timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.params
            .get(TIMEOUT_KEY)
            .and_then(Value::as_u64)
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::illegal_argument(format!("context key '{}': {}", key, e)))
}
