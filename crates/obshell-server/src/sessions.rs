// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic removal of expired sessions.

use std::sync::Arc;
use std::time::Duration;

use obshell_security::SessionManager;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SessionSweeperConfig {
    /// Period between sweeps.
    pub interval: Duration,
}

impl Default for SessionSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Background sweeper over a [`SessionManager`].
pub struct SessionSweeper {
    sessions: Arc<SessionManager>,
    config: SessionSweeperConfig,
    shutdown: Arc<Notify>,
}

impl SessionSweeper {
    /// Create a sweeper.
    pub fn new(sessions: Arc<SessionManager>, config: SessionSweeperConfig) -> Self {
        Self {
            sessions,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Session sweeper started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(live = self.sessions.len(), "Session sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let removed = self.sessions.sweep();
                    if removed > 0 {
                        debug!(removed, live = self.sessions.len(), "Expired sessions removed");
                    }
                }
            }
        }
    }
}
