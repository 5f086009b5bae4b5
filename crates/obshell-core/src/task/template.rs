// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG templates.
//!
//! A template is the immutable plan a handler hands to the engine: an
//! ordered list of nodes, each holding the sub-tasks to run on one or more
//! agents.
//!
//! ```ignore
//! let template = Template::builder("Join to master")
//!     .scope(MaintenanceScope::Global)
//!     .node(NodeTemplate::single(JOIN_TO_MASTER))
//!     .node(NodeTemplate::single(BE_FOLLOWER))
//!     .build()?;
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentAddr;
use crate::error::{Error, ErrorKind, Result};

use super::types::{MaintenanceScope, StoreScope, TaskFlags};

/// Sub-task data key naming the peer a remote task acts on.
pub const TARGET_AGENT_KEY: &str = "target_agent";

/// One sub-task of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Registered task type name.
    pub type_name: String,
    /// Display name; defaults to the type name.
    pub name: String,
    /// Overrides the registered capability flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<TaskFlags>,
    /// Initial sub-task data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
    /// Executing agent; `None` means the agent creating the DAG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentAddr>,
}

impl TaskTemplate {
    /// Sub-task of type `type_name`.
    pub fn new(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: type_name.clone(),
            type_name,
            flags: None,
            data: BTreeMap::new(),
            agent: None,
        }
    }

    /// Set the display name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override capability flags.
    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Run on `agent`.
    pub fn on(mut self, agent: AgentAddr) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Seed sub-task data.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }
}

/// One stage of a DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Node name.
    pub name: String,
    /// Run the sub-tasks concurrently; otherwise in declared order.
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Sub-tasks.
    pub tasks: Vec<TaskTemplate>,
}

fn default_parallel() -> bool {
    true
}

impl NodeTemplate {
    /// Empty parallel node.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parallel: true,
            tasks: Vec::new(),
        }
    }

    /// Node with one sub-task of `type_name` on the creating agent.
    pub fn single(type_name: impl Into<String>) -> Self {
        let task = TaskTemplate::new(type_name);
        Self::new(task.name.clone()).task(task)
    }

    /// Node with one sub-task of `type_name` per agent.
    pub fn on_agents(type_name: impl Into<String>, agents: &[AgentAddr]) -> Self {
        let type_name = type_name.into();
        let mut node = Self::new(type_name.clone());
        for agent in agents {
            node = node.task(TaskTemplate::new(type_name.clone()).on(agent.clone()));
        }
        node
    }

    /// Node with one sub-task of `type_name` per peer, all executed by the
    /// creating agent with the peer recorded under [`TARGET_AGENT_KEY`].
    pub fn remote_on(type_name: impl Into<String>, peers: &[AgentAddr]) -> Result<Self> {
        let type_name = type_name.into();
        let mut node = Self::new(type_name.clone());
        for peer in peers {
            node = node.task(
                TaskTemplate::new(type_name.clone())
                    .named(format!("{} on {}", type_name, peer))
                    .with_data(TARGET_AGENT_KEY, peer)?,
            );
        }
        Ok(node)
    }

    /// Run sub-tasks one after another.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Append a sub-task.
    pub fn task(mut self, task: TaskTemplate) -> Self {
        self.tasks.push(task);
        self
    }
}

/// A DAG plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// DAG name.
    pub name: String,
    /// Maintenance scope.
    pub scope: MaintenanceScope,
    /// Store holding the DAG.
    pub store: StoreScope,
    /// Ordered nodes.
    pub nodes: Vec<NodeTemplate>,
}

impl Template {
    /// Start building a local, non-maintenance template.
    pub fn builder(name: impl Into<String>) -> TemplateBuilder {
        TemplateBuilder {
            name: name.into(),
            scope: MaintenanceScope::UnMaintenance,
            store: StoreScope::Local,
            nodes: Vec::new(),
        }
    }

    /// Reject plans without any sub-task.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() || self.nodes.iter().any(|n| n.tasks.is_empty()) {
            return Err(Error::with_args(ErrorKind::TaskTemplateEmpty, [&self.name]));
        }
        Ok(())
    }

    /// Agents the plan names: executing agents and [`TARGET_AGENT_KEY`]
    /// peers.
    pub fn targets(&self) -> Result<BTreeSet<AgentAddr>> {
        let mut targets = BTreeSet::new();
        for task in self.nodes.iter().flat_map(|n| &n.tasks) {
            if let Some(agent) = &task.agent {
                targets.insert(agent.clone());
            }
            if let Some(peer) = task.data.get(TARGET_AGENT_KEY) {
                targets.insert(serde_json::from_value(peer.clone())?);
            }
        }
        Ok(targets)
    }

    /// Number of stages.
    pub fn max_stage(&self) -> i32 {
        self.nodes.len() as i32
    }
}

/// Builder for [`Template`].
#[derive(Debug, Clone)]
pub struct TemplateBuilder {
    name: String,
    scope: MaintenanceScope,
    store: StoreScope,
    nodes: Vec<NodeTemplate>,
}

impl TemplateBuilder {
    /// Set the maintenance scope.
    pub fn scope(mut self, scope: MaintenanceScope) -> Self {
        self.scope = scope;
        self
    }

    /// Store the DAG in the cluster store.
    pub fn cluster(mut self) -> Self {
        self.store = StoreScope::Cluster;
        self
    }

    /// Store the DAG in the given store.
    pub fn store(mut self, store: StoreScope) -> Self {
        self.store = store;
        self
    }

    /// Append a node.
    pub fn node(mut self, node: NodeTemplate) -> Self {
        self.nodes.push(node);
        self
    }

    /// Finish, rejecting empty plans.
    pub fn build(self) -> Result<Template> {
        let template = Template {
            name: self.name,
            scope: self.scope,
            store: self.store,
            nodes: self.nodes,
        };
        template.validate()?;
        Ok(template)
    }
}
