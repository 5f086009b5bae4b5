// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stored SSH credentials.
//!
//! Passphrases are wrapped under a per-cluster [`SecretKey`] kept in
//! `ocs_config` under [`SECRET_KEY_CONFIG`], generated on first use.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use obshell_security::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::persistence::{ClusterStore, CredentialRecord, NewCredential};

/// `ocs_config` name of the stored key.
pub const SECRET_KEY_CONFIG: &str = "credential_secret_key";

const SSH_TIMEOUT: Duration = Duration::from_secs(10);

/// One SSH endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialTarget {
    /// Host.
    pub ip: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

/// Body of `POST /api/v1/security/credential`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCredential {
    /// Target type, e.g. `HOST`.
    pub target_type: String,
    /// Unique name per target type.
    pub name: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Endpoints.
    pub targets: Vec<CredentialTarget>,
    /// SSH user.
    pub username: String,
    /// Authentication type.
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    /// Plain passphrase.
    pub passphrase: String,
}

fn default_auth_type() -> String {
    "PASSWORD".to_string()
}

/// Body of `PATCH /api/v1/security/credential/{id}`; absent fields keep
/// their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCredential {
    /// New description.
    pub description: Option<String>,
    /// New endpoints.
    pub targets: Option<Vec<CredentialTarget>>,
    /// New user.
    pub username: Option<String>,
    /// New authentication type.
    pub auth_type: Option<String>,
    /// New plain passphrase.
    pub passphrase: Option<String>,
}

/// A credential as returned by the API. The passphrase never leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialView {
    /// Id.
    pub id: i64,
    /// Target type.
    pub target_type: String,
    /// Name.
    pub name: String,
    /// Free text.
    pub description: String,
    /// Endpoints.
    pub targets: Vec<CredentialTarget>,
    /// SSH user.
    pub username: String,
    /// Authentication type.
    pub auth_type: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl CredentialView {
    fn from_record(record: CredentialRecord) -> Result<Self> {
        Ok(Self {
            targets: serde_json::from_str(&record.targets)?,
            id: record.id,
            target_type: record.target_type,
            name: record.name,
            description: record.description,
            username: record.username,
            auth_type: record.auth_type,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Outcome of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Probed endpoint.
    pub target: CredentialTarget,
    /// Whether login succeeded.
    pub connected: bool,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Probe of stored credentials against their endpoints.
pub trait SshProbe: Send + Sync {
    /// Try to log in; blocking.
    fn login(&self, target: &CredentialTarget, username: &str, passphrase: &str) -> io::Result<()>;
}

/// [`SshProbe`] backed by libssh2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Probe;

impl SshProbe for Ssh2Probe {
    fn login(&self, target: &CredentialTarget, username: &str, passphrase: &str) -> io::Result<()> {
        let addr = (target.ip.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))?;
        let tcp = TcpStream::connect_timeout(&addr, SSH_TIMEOUT)?;
        let mut session = ssh2::Session::new()?;
        session.set_timeout(SSH_TIMEOUT.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_password(username, passphrase)?;
        if session.authenticated() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "authentication rejected"))
        }
    }
}

/// Credential operations over the cluster store.
#[derive(Clone)]
pub struct CredentialService {
    cluster: Arc<dyn ClusterStore>,
    probe: Arc<dyn SshProbe>,
    key_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService").finish_non_exhaustive()
    }
}

impl CredentialService {
    /// Service probing with libssh2.
    pub fn new(cluster: Arc<dyn ClusterStore>) -> Self {
        Self::with_probe(cluster, Arc::new(Ssh2Probe))
    }

    /// Service with a custom probe.
    pub fn with_probe(cluster: Arc<dyn ClusterStore>, probe: Arc<dyn SshProbe>) -> Self {
        Self {
            cluster,
            probe,
            key_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The cluster key, generated and stored on first use.
    async fn secret_key(&self) -> Result<SecretKey> {
        let _guard = self.key_lock.lock().await;
        if let Some(stored) = self.cluster.get_ocs_config(SECRET_KEY_CONFIG).await? {
            return Ok(SecretKey::from_stored(&stored)?);
        }
        let key = SecretKey::generate();
        self.cluster
            .set_ocs_config(SECRET_KEY_CONFIG, &key.to_stored()?)
            .await?;
        info!("Generated credential secret key");
        Ok(key)
    }

    async fn record(&self, id: i64) -> Result<CredentialRecord> {
        self.cluster
            .get_credential(id)
            .await?
            .ok_or_else(|| Error::with_args(ErrorKind::CommonNotFound, [format!("credential {}", id)]))
    }

    /// Store a credential.
    #[instrument(skip_all, fields(target_type = %req.target_type, name = %req.name))]
    pub async fn create(&self, req: CreateCredential) -> Result<CredentialView> {
        if req.name.is_empty() || req.targets.is_empty() {
            return Err(Error::illegal_argument("credential needs a name and at least one target"));
        }
        if self.cluster.find_credential(&req.target_type, &req.name).await?.is_some() {
            return Err(Error::illegal_argument(format!(
                "credential {} already exists for {}",
                req.name, req.target_type
            )));
        }
        let key = self.secret_key().await?;
        let id = self
            .cluster
            .insert_credential(&NewCredential {
                target_type: req.target_type,
                name: req.name,
                description: req.description,
                targets: serde_json::to_string(&req.targets)?,
                username: req.username,
                auth_type: req.auth_type,
                passphrase: key.encrypt(&req.passphrase)?,
            })
            .await?;
        info!(credential_id = id, "Credential stored");
        self.get(id).await
    }

    /// Fetch one credential.
    pub async fn get(&self, id: i64) -> Result<CredentialView> {
        CredentialView::from_record(self.record(id).await?)
    }

    /// All credentials, optionally of one target type.
    pub async fn list(&self, target_type: Option<&str>) -> Result<Vec<CredentialView>> {
        self.cluster
            .list_credentials(target_type)
            .await?
            .into_iter()
            .map(CredentialView::from_record)
            .collect()
    }

    /// Update the given fields.
    pub async fn patch(&self, id: i64, patch: PatchCredential) -> Result<CredentialView> {
        let mut record = self.record(id).await?;
        if let Some(description) = patch.description {
            record.description = description;
        }
        if let Some(targets) = patch.targets {
            if targets.is_empty() {
                return Err(Error::illegal_argument("credential needs at least one target"));
            }
            record.targets = serde_json::to_string(&targets)?;
        }
        if let Some(username) = patch.username {
            record.username = username;
        }
        if let Some(auth_type) = patch.auth_type {
            record.auth_type = auth_type;
        }
        if let Some(passphrase) = patch.passphrase {
            record.passphrase = self.secret_key().await?.encrypt(&passphrase)?;
        }
        self.cluster.update_credential(&record).await?;
        self.get(id).await
    }

    /// Delete one credential.
    pub async fn delete(&self, id: i64) -> Result<()> {
        if self.cluster.delete_credentials(&[id]).await? == 0 {
            return Err(Error::with_args(ErrorKind::CommonNotFound, [format!("credential {}", id)]));
        }
        Ok(())
    }

    /// Delete several credentials; unknown ids are skipped.
    pub async fn batch_delete(&self, ids: &[i64]) -> Result<u64> {
        self.cluster.delete_credentials(ids).await
    }

    /// Decrypted passphrase of a credential.
    pub async fn passphrase(&self, id: i64) -> Result<String> {
        let record = self.record(id).await?;
        Ok(self.secret_key().await?.decrypt(&record.passphrase)?)
    }

    /// Probe every endpoint of a credential over SSH.
    #[instrument(skip(self))]
    pub async fn validate(&self, id: i64) -> Result<Vec<ValidationResult>> {
        let record = self.record(id).await?;
        let targets: Vec<CredentialTarget> = serde_json::from_str(&record.targets)?;
        let passphrase = self.secret_key().await?.decrypt(&record.passphrase)?;
        let probe = self.probe.clone();
        let username = record.username;

        tokio::task::spawn_blocking(move || {
            targets
                .into_iter()
                .map(|target| match probe.login(&target, &username, &passphrase) {
                    Ok(()) => ValidationResult {
                        target,
                        connected: true,
                        message: String::new(),
                    },
                    Err(e) => {
                        warn!(target = %target.ip, error = %e, "Credential probe failed");
                        ValidationResult {
                            target,
                            connected: false,
                            message: e.to_string(),
                        }
                    }
                })
                .collect()
        })
        .await
        .map_err(|e| Error::unexpected(format!("credential probe panicked: {}", e)))
    }

    /// Replace the cluster key and re-wrap every passphrase in one
    /// transaction.
    #[instrument(skip_all)]
    pub async fn rotate_secret_key(&self, new_key: SecretKey) -> Result<usize> {
        let old = self.secret_key().await?;
        let _guard = self.key_lock.lock().await;
        let mut rewrapped = Vec::new();
        for record in self.cluster.list_credentials(None).await? {
            let plain = old.decrypt(&record.passphrase)?;
            rewrapped.push((record.id, new_key.encrypt(&plain)?));
        }
        self.cluster
            .rotate_credentials(SECRET_KEY_CONFIG, &new_key.to_stored()?, &rewrapped)
            .await?;
        info!(credentials = rewrapped.len(), "Credential secret key rotated");
        Ok(rewrapped.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProbe {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl SshProbe for RecordingProbe {
        fn login(&self, target: &CredentialTarget, username: &str, passphrase: &str) -> io::Result<()> {
            self.seen.lock().push((username.to_string(), passphrase.to_string()));
            if target.ip == "10.0.0.1" {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }
        }
    }

    fn create(name: &str, passphrase: &str) -> CreateCredential {
        CreateCredential {
            target_type: "HOST".to_string(),
            name: name.to_string(),
            description: String::new(),
            targets: vec![
                CredentialTarget { ip: "10.0.0.1".to_string(), port: 22 },
                CredentialTarget { ip: "10.0.0.2".to_string(), port: 22 },
            ],
            username: "admin".to_string(),
            auth_type: default_auth_type(),
            passphrase: passphrase.to_string(),
        }
    }

    async fn service() -> (CredentialService, Arc<SqlitePersistence>, Arc<RecordingProbe>) {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let probe = Arc::new(RecordingProbe::default());
        (CredentialService::with_probe(store.clone(), probe.clone()), store, probe)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_names() {
        let (service, _, _) = service().await;
        let view = service.create(create("c1", "p1")).await.unwrap();
        assert_eq!(view.targets.len(), 2);
        assert_eq!(service.passphrase(view.id).await.unwrap(), "p1");

        let err = service.create(create("c1", "other")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommonIllegalArgument);
    }

    #[tokio::test]
    async fn test_rotation_rewraps_every_passphrase() {
        let (service, store, _) = service().await;
        let mut ids = Vec::new();
        for (name, pass) in [("c1", "p1"), ("c2", "p2"), ("c3", "p3")] {
            ids.push(service.create(create(name, pass)).await.unwrap().id);
        }
        let old = SecretKey::from_stored(&store.get_ocs_config(SECRET_KEY_CONFIG).await.unwrap().unwrap())
            .unwrap();

        assert_eq!(service.rotate_secret_key(SecretKey::generate()).await.unwrap(), 3);

        for (id, pass) in ids.iter().zip(["p1", "p2", "p3"]) {
            assert_eq!(service.passphrase(*id).await.unwrap(), pass);
            let record = store.get_credential(*id).await.unwrap().unwrap();
            assert!(old.decrypt(&record.passphrase).is_err());
        }
    }

    #[tokio::test]
    async fn test_validate_probes_each_target() {
        let (service, _, probe) = service().await;
        let id = service.create(create("c1", "p1")).await.unwrap().id;
        let results = service.validate(id).await.unwrap();
        assert!(results[0].connected);
        assert!(!results[1].connected);
        assert_eq!(results[1].message, "refused");
        assert_eq!(probe.seen.lock().len(), 2);
        assert_eq!(probe.seen.lock()[0], ("admin".to_string(), "p1".to_string()));
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let (service, _, _) = service().await;
        let id = service.create(create("c1", "p1")).await.unwrap().id;
        let view = service
            .patch(
                id,
                PatchCredential {
                    username: Some("root".to_string()),
                    passphrase: Some("p9".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(view.username, "root");
        assert_eq!(service.passphrase(id).await.unwrap(), "p9");

        service.delete(id).await.unwrap();
        assert_eq!(service.delete(id).await.unwrap_err().kind(), ErrorKind::CommonNotFound);
    }
}
