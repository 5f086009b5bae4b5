// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State shared by every handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use obshell_core::AgentContext;
use serde::{Deserialize, Serialize};

/// Lifecycle of the agent process as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentLifecycle {
    /// Stores open, workers not yet running.
    Starting,
    /// Serving.
    Running,
    /// Shutdown requested.
    Stopping,
}

impl AgentLifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Starting,
            1 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

/// Handler state. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ServerState {
    /// The assembled agent.
    pub ctx: AgentContext,
    lifecycle: Arc<AtomicU8>,
}

impl ServerState {
    /// Wrap an assembled agent; the lifecycle starts at STARTING.
    pub fn new(ctx: AgentContext) -> Self {
        Self {
            ctx,
            lifecycle: Arc::new(AtomicU8::new(AgentLifecycle::Starting as u8)),
        }
    }

    /// Current lifecycle.
    pub fn lifecycle(&self) -> AgentLifecycle {
        AgentLifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Move to `lifecycle`.
    pub fn set_lifecycle(&self, lifecycle: AgentLifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }
}
