// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent secrets held in the local store.
//!
//! | Secret | Stored form |
//! |--------|-------------|
//! | `rsa_private_key` | PKCS#8 PEM |
//! | `agent_token` | hex of 32 random bytes |
//! | `agent_password` | hex SHA-256 digest |
//! | `root_password` | hex SHA-256 digest |
//!
//! A missing key pair is regenerated on boot, which also replaces the token
//! so that peers holding the old one must re-register.

use std::sync::Arc;

use obshell_security::{AgentKeyPair, SessionManager, password};
use parking_lot::RwLock;
use rand::RngCore;
use tracing::{info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::persistence::LocalStore;

/// Secret name of the private key.
pub const SECRET_RSA_KEY: &str = "rsa_private_key";
/// Secret name of this agent's bearer token.
pub const SECRET_AGENT_TOKEN: &str = "agent_token";
/// Secret name of the agent password digest.
pub const SECRET_AGENT_PASSWORD: &str = "agent_password";
/// Secret name of the database root password digest.
pub const SECRET_ROOT_PASSWORD: &str = "root_password";

const TOKEN_BYTES: usize = 32;

/// Key pair, token and password digests of this agent.
pub struct Keyring {
    local: Arc<dyn LocalStore>,
    sessions: Arc<SessionManager>,
    pair: RwLock<Arc<AgentKeyPair>>,
    token: RwLock<String>,
    agent_password: RwLock<Option<String>>,
    root_password: RwLock<Option<String>>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("pair", &*self.pair.read())
            .field("agent_password_set", &self.agent_password.read().is_some())
            .field("root_password_set", &self.root_password.read().is_some())
            .finish_non_exhaustive()
    }
}

/// Fresh bearer token.
pub fn generate_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

impl Keyring {
    /// Restore secrets from `local`, generating what is missing.
    pub async fn load(local: Arc<dyn LocalStore>, sessions: Arc<SessionManager>) -> Result<Self> {
        Self::load_with(local, sessions, AgentKeyPair::generate).await
    }

    /// Like [`Keyring::load`] with a custom key generator.
    pub async fn load_with<G>(
        local: Arc<dyn LocalStore>,
        sessions: Arc<SessionManager>,
        generate: G,
    ) -> Result<Self>
    where
        G: FnOnce() -> obshell_security::Result<AgentKeyPair>,
    {
        let (pair, regenerated) = match local.get_secret(SECRET_RSA_KEY).await? {
            Some(pem) => (AgentKeyPair::from_private_pem(&pem)?, false),
            None => {
                let pair = generate()?;
                local.set_secret(SECRET_RSA_KEY, &pair.private_pem()?).await?;
                info!("Generated agent key pair");
                (pair, true)
            }
        };

        let token = match local.get_secret(SECRET_AGENT_TOKEN).await? {
            Some(token) if !regenerated => token,
            previous => {
                if previous.is_some() {
                    warn!("Key pair was regenerated, replacing agent token");
                }
                let token = generate_token();
                local.set_secret(SECRET_AGENT_TOKEN, &token).await?;
                token
            }
        };

        Ok(Self {
            agent_password: RwLock::new(local.get_secret(SECRET_AGENT_PASSWORD).await?),
            root_password: RwLock::new(local.get_secret(SECRET_ROOT_PASSWORD).await?),
            local,
            sessions,
            pair: RwLock::new(Arc::new(pair)),
            token: RwLock::new(token),
        })
    }

    /// The key pair unwrapping inbound headers.
    pub fn key_pair(&self) -> Arc<AgentKeyPair> {
        self.pair.read().clone()
    }

    /// PEM of the public key.
    pub fn public_pem(&self) -> Result<String> {
        Ok(self.pair.read().public_pem()?)
    }

    /// This agent's bearer token.
    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    /// Session table.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Replace the token.
    pub async fn rotate_token(&self) -> Result<String> {
        let token = generate_token();
        self.local.set_secret(SECRET_AGENT_TOKEN, &token).await?;
        *self.token.write() = token.clone();
        info!("Agent token rotated");
        Ok(token)
    }

    /// Compare a presented token in constant time.
    pub fn verify_token(&self, presented: &str) -> Result<()> {
        if !presented.is_empty()
            && password::constant_time_eq(presented.as_bytes(), self.token.read().as_bytes())
        {
            return Ok(());
        }
        Err(Error::new(ErrorKind::SecurityTokenInvalid))
    }

    /// Set the agent password.
    pub async fn set_agent_password(&self, plain: &str) -> Result<()> {
        let digest = password::digest(plain);
        self.local.set_secret(SECRET_AGENT_PASSWORD, &digest).await?;
        *self.agent_password.write() = Some(digest);
        let dropped = self.sessions.invalidate_all();
        info!(dropped_sessions = dropped, "Agent password changed");
        Ok(())
    }

    /// Check the agent password. Without one set only the empty password passes.
    pub fn verify_agent_password(&self, presented: &str) -> Result<()> {
        if check(self.agent_password.read().as_deref(), presented) {
            return Ok(());
        }
        Err(Error::with_args(ErrorKind::SecurityAuthAgent, ["wrong agent password"]))
    }

    /// Set the database root password.
    pub async fn set_root_password(&self, plain: &str) -> Result<()> {
        let digest = password::digest(plain);
        self.local.set_secret(SECRET_ROOT_PASSWORD, &digest).await?;
        *self.root_password.write() = Some(digest);
        let dropped = self.sessions.invalidate_all();
        info!(dropped_sessions = dropped, "Root password changed");
        Ok(())
    }

    /// Check the database root password. Without one set only the empty
    /// password passes.
    pub fn verify_root_password(&self, presented: &str) -> Result<()> {
        if check(self.root_password.read().as_deref(), presented) {
            return Ok(());
        }
        Err(Error::with_args(ErrorKind::SecurityAuthDb, ["wrong root password"]))
    }
}

fn check(stored: Option<&str>, presented: &str) -> bool {
    match stored {
        Some(digest) => password::verify(presented, digest),
        None => presented.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use std::collections::HashMap;
    use std::time::Duration;

    fn small_pair() -> obshell_security::Result<AgentKeyPair> {
        AgentKeyPair::generate_with_bits(1024)
    }

    fn sessions() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(Duration::from_secs(60), 8))
    }

    #[tokio::test]
    async fn test_restart_restores_key_and_token() {
        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let first = Keyring::load_with(local.clone(), sessions(), small_pair).await.unwrap();
        let second = Keyring::load_with(local.clone(), sessions(), || panic!("must not regenerate"))
            .await
            .unwrap();
        assert_eq!(first.public_pem().unwrap(), second.public_pem().unwrap());
        assert_eq!(first.token(), second.token());
        second.verify_token(&first.token()).unwrap();
        assert_eq!(
            second.verify_token("nope").unwrap_err().kind(),
            ErrorKind::SecurityTokenInvalid
        );
    }

    #[tokio::test]
    async fn test_lost_key_replaces_token() {
        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        local.set_secret(SECRET_AGENT_TOKEN, "old-token").await.unwrap();
        let keyring = Keyring::load_with(local.clone(), sessions(), small_pair).await.unwrap();
        assert_ne!(keyring.token(), "old-token");
        assert_eq!(
            local.get_secret(SECRET_AGENT_TOKEN).await.unwrap(),
            Some(keyring.token())
        );
    }

    #[tokio::test]
    async fn test_password_change_invalidates_sessions() {
        let local = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let keyring = Keyring::load_with(local, sessions(), small_pair).await.unwrap();
        keyring.verify_root_password("").unwrap();

        keyring.sessions().create(HashMap::new());
        keyring.set_root_password("secret123").await.unwrap();
        assert!(keyring.sessions().is_empty());
        keyring.verify_root_password("secret123").unwrap();
        assert_eq!(
            keyring.verify_root_password("").unwrap_err().kind(),
            ErrorKind::SecurityAuthDb
        );

        keyring.set_agent_password("agentpw").await.unwrap();
        keyring.verify_agent_password("agentpw").unwrap();
        assert!(keyring.verify_agent_password("x").is_err());
    }
}
