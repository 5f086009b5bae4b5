// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The RSA-wrapped authentication header.
//!
//! Two header names carry the same payload:
//!
//! | Header | Auth field carries |
//! |--------|--------------------|
//! | `OCS_HEADER` | database root password |
//! | `OCS_AGENT_HEADER` | agent password |
//!
//! The payload is the JSON encoding of [`AuthHeader`], encrypted with the
//! *target* agent's public key and base64 encoded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::body::BodyKeys;
use crate::error::{Result, SecurityError};
use crate::keys::{AgentKeyPair, encrypt_for};

/// Header carrying database-authenticated requests.
pub const OCS_HEADER: &str = "OCS_HEADER";

/// Header carrying agent-password-authenticated requests.
pub const OCS_AGENT_HEADER: &str = "OCS_AGENT_HEADER";

/// How a follower replays a request that belongs to the maintainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForwardType {
    /// Not forwarded.
    #[default]
    Not,
    /// Forwarded by the agent itself after detecting it is not the maintainer.
    Auto,
    /// Forwarded on explicit request of the caller.
    Manual,
}

/// Address of the agent that forwarded a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardAgent {
    /// Agent ip.
    pub ip: String,
    /// Agent HTTP port.
    pub port: u16,
}

/// Decrypted authentication header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthHeader {
    /// Cleartext password (root or agent, depending on the header name).
    #[serde(default)]
    pub auth: String,
    /// Expiry in unix seconds.
    pub ts: i64,
    /// Bearer token of the calling agent, if the caller is an agent.
    #[serde(default)]
    pub token: String,
    /// URI the header was minted for.
    pub uri: String,
    /// Base64 of the 16-byte AES key followed by the 16-byte IV, or empty.
    #[serde(default)]
    pub keys: String,
    /// Hex SHA-256 of an uploaded file, or empty.
    #[serde(default)]
    pub sha256: String,
    /// Forwarding mode.
    #[serde(default)]
    pub forward_type: ForwardType,
    /// Agent that forwarded the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_agent: Option<ForwardAgent>,
}

impl AuthHeader {
    /// Create a header for `uri` that expires `ttl_secs` from `now`.
    pub fn new(auth: impl Into<String>, uri: impl Into<String>, now: i64, ttl_secs: i64) -> Self {
        Self {
            auth: auth.into(),
            ts: now + ttl_secs,
            token: String::new(),
            uri: uri.into(),
            keys: String::new(),
            sha256: String::new(),
            forward_type: ForwardType::Not,
            forward_agent: None,
        }
    }

    /// Attach the calling agent's bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Attach body encryption keys.
    pub fn with_body_keys(mut self, keys: &BodyKeys) -> Self {
        self.keys = keys.encode();
        self
    }

    /// Attach the digest of an uploaded file.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = digest.into();
        self
    }

    /// Mark the header as forwarded by `agent`.
    pub fn forwarded_by(mut self, forward_type: ForwardType, agent: ForwardAgent) -> Self {
        self.forward_type = forward_type;
        self.forward_agent = Some(agent);
        self
    }

    /// Encrypt for the holder of `public` and base64 encode.
    pub fn seal(&self, public: &RsaPublicKey) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| SecurityError::Key(e.to_string()))?;
        let cipher = encrypt_for(public, &json)?;
        Ok(STANDARD.encode(cipher))
    }

    /// Decode and decrypt a header value with the agent's private key.
    pub fn open(pair: &AgentKeyPair, encoded: &str) -> Result<Self> {
        let cipher = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SecurityError::HeaderDecrypt(e.to_string()))?;
        let plain = pair.decrypt(&cipher)?;
        serde_json::from_slice(&plain).map_err(|e| SecurityError::HeaderDecrypt(e.to_string()))
    }

    /// The header must have been minted for the received URI.
    ///
    /// Query strings are ignored on both sides.
    pub fn verify_uri(&self, request_uri: &str) -> Result<()> {
        let strip = |uri: &str| uri.split('?').next().unwrap_or(uri).to_string();
        if strip(&self.uri) != strip(request_uri) {
            return Err(SecurityError::UriMismatch {
                header: self.uri.clone(),
                request: request_uri.to_string(),
            });
        }
        Ok(())
    }

    /// `Ts` must lie strictly in the future.
    pub fn verify_fresh(&self, now: i64) -> Result<()> {
        if self.ts <= now {
            return Err(SecurityError::Expired {
                expired_at: self.ts,
            });
        }
        Ok(())
    }

    /// Body keys carried by the header, if any.
    pub fn body_keys(&self) -> Result<Option<BodyKeys>> {
        if self.keys.is_empty() {
            return Ok(None);
        }
        BodyKeys::decode(&self.keys).map(Some)
    }

    /// Whether the header was forwarded by another agent.
    pub fn is_forwarded(&self) -> bool {
        self.forward_type != ForwardType::Not
    }
}
