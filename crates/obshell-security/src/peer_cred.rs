// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! UID policy for the Unix-domain administrative socket.
//!
//! A peer is admitted when its UID is root, the agent's own real or
//! effective UID, the owner of the agent home directory, or the owner of
//! the running database process.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{Uid, geteuid, getuid};
use tracing::debug;

use crate::error::{Result, SecurityError};

/// The set of UIDs admitted on the administrative socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPolicy {
    allowed: Vec<u32>,
}

impl PeerPolicy {
    /// Policy admitting root and the current process UIDs only.
    pub fn current_process() -> Self {
        let mut policy = Self {
            allowed: Vec::new(),
        };
        policy.allow(Uid::from_raw(0).as_raw());
        policy.allow(getuid().as_raw());
        policy.allow(geteuid().as_raw());
        policy
    }

    /// Full policy for an agent rooted at `home`.
    ///
    /// `db_pid` is the pid of the database process, when it is running.
    pub fn for_agent(home: &Path, db_pid: Option<u32>) -> Self {
        let mut policy = Self::current_process();
        match std::fs::metadata(home) {
            Ok(meta) => policy.allow(meta.uid()),
            Err(e) => debug!(home = %home.display(), error = %e, "Home directory owner unavailable"),
        }
        if let Some(pid) = db_pid
            && let Ok(meta) = std::fs::metadata(format!("/proc/{}", pid))
        {
            policy.allow(meta.uid());
        }
        policy
    }

    /// Add a UID to the admitted set.
    pub fn allow(&mut self, uid: u32) {
        if !self.allowed.contains(&uid) {
            self.allowed.push(uid);
        }
    }

    /// Admit or reject a peer UID.
    pub fn check(&self, uid: u32) -> Result<()> {
        if self.allowed.contains(&uid) {
            Ok(())
        } else {
            Err(SecurityError::PermissionDenied { uid })
        }
    }
}
