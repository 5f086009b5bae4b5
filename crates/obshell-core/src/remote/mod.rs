// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer RPC and the sub-task types that act on peers.
//!
//! - [`client`]: authenticated, body-encrypted calls to other agents
//! - [`executable`]: run a DAG on a peer and report it as a local sub-task
//! - [`rendezvous`]: stage barriers between a main DAG and its sub-DAGs
//! - [`join`]: the join-to-master sub-tasks

pub mod client;
pub mod executable;
pub mod join;
pub mod rendezvous;

pub use client::{AgentSecret, ForwardRequest, RpcAuth, RpcClient, TRACE_ID_HEADER};
pub use executable::RemoteSubDag;

/// URIs served by every agent.
pub mod paths {
    /// Public key of the agent, unauthenticated.
    pub const SECRET: &str = "/api/v1/secret";
    /// Liveness and role, unauthenticated.
    pub const STATUS: &str = "/api/v1/status";
    /// Prefix of DAG detail and operator URIs; the generic id follows.
    pub const DAG: &str = "/api/v1/task/dag";
    /// Maintenance DAG currently held on the agent.
    pub const MAINTAIN_DAG: &str = "/api/v1/task/dag/maintain/agent";
    /// Create a DAG from a template on the receiving agent.
    pub const SUB_DAG: &str = "/rpc/v1/task/sub_dag";
    /// Shipped cluster sub-task logs.
    pub const TASK_LOG: &str = "/rpc/v1/task/log";
    /// Join (POST) and leave (DELETE) on the master.
    pub const AGENT: &str = "/rpc/v1/agent";
    /// Refresh the caller's token on the master.
    pub const AGENT_TOKEN: &str = "/rpc/v1/agent/token";
    /// Update the caller's identity record on the master.
    pub const AGENT_UPDATE: &str = "/rpc/v1/agent/update";
    /// Current maintainer.
    pub const MAINTAINER: &str = "/rpc/v1/maintainer";
    /// Force a maintainer re-publish.
    pub const MAINTAINER_UPDATE: &str = "/rpc/v1/maintainer/update";

    /// Detail URI of a DAG.
    pub fn dag(id: impl std::fmt::Display) -> String {
        format!("{}/{}", DAG, id)
    }
}
