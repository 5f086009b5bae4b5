// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG task engine.
//!
//! A DAG is an ordered list of nodes; each node holds sub-tasks that run in
//! parallel or one after another on one or more agents. The engine is split
//! into:
//!
//! - [`template`]: the immutable plan handed to the engine
//! - [`state`]: the pure state machine driving DAGs, nodes and sub-tasks
//! - [`executor`]: the bounded worker pool invoking [`Executable`]s
//! - [`scheduler`]: the periodic driver advancing live DAGs
//! - [`service`]: the operations exposed to handlers

pub mod context;
pub mod executable;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod template;
pub mod types;

pub use context::TaskContext;
pub use executable::{EnvParts, Executable, ExecutionEnv, TaskError, TaskResult};
pub use executor::{EngineDeps, ExecutorConfig, ExecutorPool};
pub use registry::TaskRegistry;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use service::{DagDetail, DagOperatorRequest, NodeDetail, SubTaskDetail, TaskService};
pub use template::{NodeTemplate, TARGET_AGENT_KEY, TaskTemplate, Template};
pub use types::{GenericId, MaintenanceScope, Operator, StoreScope, TaskFlags, TaskKey, TaskState};
