// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! obshell Core - the engine of a database control-plane agent.
//!
//! One agent runs next to every database process. Together they elect a
//! maintainer and drive multi-step operations as persisted DAGs that
//! survive the crash of any agent.
//!
//! # Architecture
//!
//! ```text
//!   handlers ──► TaskService ──► TaskStore (local SQLite | cluster MySQL)
//!                    │                 ▲
//!                    ▼                 │
//!   Scheduler ──► ExecutorPool ──► Executable ──► RpcClient ──► peers
//!       ▲
//!       └── Coordinator (maintainer election)
//!
//!   Synchronizer: local mirror ──► cluster store
//! ```
//!
//! # Modules
//!
//! - [`task`]: templates, state machine, executor pool, scheduler
//! - [`coordinator`]: maintainer election over the agent table
//! - [`remote`]: peer RPC and sub-tasks that act on peers
//! - [`persistence`]: the local and cluster stores
//! - [`synchronizer`]: convergence of locally mirrored cluster state
//! - [`runtime`]: assembly of a running agent

#![deny(missing_docs)]

/// Agent identity, roles and status.
pub mod agent;

/// Configuration loaded from the environment.
pub mod config;

/// Maintainer election.
pub mod coordinator;

/// Stored SSH credentials.
pub mod credential;

/// Error kinds and the shared error type.
pub mod error;

/// Keys, token and password digests of this agent.
pub mod keyring;

/// Master-side member bookkeeping.
pub mod membership;

/// Embedded database migrations.
pub mod migrations;

/// Reader of the database process's configuration file.
pub mod observer_config;

/// Upgrade packages.
pub mod package;

/// Local and cluster stores.
pub mod persistence;

/// Peer RPC.
pub mod remote;

/// Response envelope shared with the HTTP layer.
pub mod response;

/// Agent assembly and background workers.
pub mod runtime;

/// Convergence of locally mirrored cluster state.
pub mod synchronizer;

/// DAG task engine.
pub mod task;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use runtime::{AgentContext, BackgroundWorkers};
