// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory session table.
//!
//! Sessions live only in process memory. Every successful lookup slides the
//! expiry forward by the TTL; a periodic sweep drops expired entries; when
//! the table is full the least recently used session is evicted.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SecurityError};

/// Session id length in raw bytes (hex doubles it).
pub const SESSION_ID_BYTES: usize = 32;

/// A logged-in session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Hex session id.
    pub id: String,
    /// Arbitrary per-session data.
    pub data: HashMap<String, Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful lookup.
    pub last_access: DateTime<Utc>,
    /// Expiry; `last_access + ttl`.
    pub expires_at: DateTime<Utc>,
}

/// Bounded session table with sliding expiry.
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    cap: usize,
}

impl SessionManager {
    /// Create a table with the given TTL and population cap.
    pub fn new(ttl: std::time::Duration, cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::hours(1)),
            cap: cap.max(1),
        }
    }

    /// Sliding TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a session.
    pub fn create(&self, data: HashMap<String, Value>) -> Session {
        self.create_at(data, Utc::now())
    }

    /// Create a session as of `now`.
    pub fn create_at(&self, data: HashMap<String, Value>, now: DateTime<Utc>) -> Session {
        let mut raw = [0u8; SESSION_ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let session = Session {
            id: hex::encode(raw),
            data,
            created_at: now,
            last_access: now,
            expires_at: now + self.ttl,
        };

        let mut sessions = self.sessions.lock();
        while sessions.len() >= self.cap {
            let Some(oldest) = sessions
                .values()
                .min_by_key(|s| s.last_access)
                .map(|s| s.id.clone())
            else {
                break;
            };
            debug!(session_id = %oldest, "Evicting least recently used session");
            sessions.remove(&oldest);
        }
        sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Look up a session and slide its expiry.
    pub fn get(&self, id: &str) -> Result<Session> {
        self.get_at(id, Utc::now())
    }

    /// Look up a session as of `now` and slide its expiry.
    pub fn get_at(&self, id: &str, now: DateTime<Utc>) -> Result<Session> {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(id) else {
            return Err(SecurityError::SessionInvalid(id.to_string()));
        };
        if session.expires_at <= now {
            sessions.remove(id);
            return Err(SecurityError::SessionExpired(id.to_string()));
        }
        session.last_access = now;
        session.expires_at = now + self.ttl;
        Ok(session.clone())
    }

    /// Remove one session.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    /// Drop every expired session and return how many were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drop every session expired as of `now`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        before - sessions.len()
    }

    /// Drop every session, e.g. after a password change.
    pub fn invalidate_all(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let n = sessions.len();
        sessions.clear();
        n
    }

    /// Number of live entries (expired but unswept included).
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
