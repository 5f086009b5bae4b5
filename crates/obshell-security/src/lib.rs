// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! obshell Security - the authentication envelope shared by every agent.
//!
//! Every protected request between a client and an agent, or between two
//! agents, carries an RSA-wrapped authentication header and optionally an
//! AES-encrypted body. This crate owns the cryptographic primitives; the
//! policy (which passwords and tokens are valid) lives in `obshell-core`.
//!
//! # Request Envelope
//!
//! ```text
//!   client                                                   agent
//!     │  GET /api/v1/secret  ────────────────────────────────►  │
//!     │  ◄──────────────────────────── RSA public key (PEM)     │
//!     │                                                          │
//!     │  OCS_HEADER: base64(RSA_pub(JSON AuthHeader))            │
//!     │  body:       AES-CBC(Keys[0..16], Keys[16..32], plain)   │
//!     │  ───────────────────────────────────────────────────►   │
//!     │                                 decrypt header (RSA_priv)│
//!     │                                 check Uri, Ts, Auth/Token│
//!     │                                 decrypt body with Keys   │
//! ```
//!
//! # Modules
//!
//! - [`keys`]: RSA key pair generation, PEM import/export
//! - [`envelope`]: the authentication header and its RSA block codec
//! - [`body`]: AES-CBC body encryption keyed by the header
//! - [`session`]: in-memory session table with sliding expiry
//! - [`credential`]: AES-256 passphrase cipher and Caesar-shifted Base64
//! - [`peer_cred`]: UID policy for the Unix-domain administrative socket
//! - [`password`]: password digests for at-rest comparison

#![deny(missing_docs)]

/// AES-CBC request body codec.
pub mod body;

/// Stored credential encryption and key obfuscation.
pub mod credential;

/// The RSA-wrapped authentication header.
pub mod envelope;

/// Security error type.
pub mod error;

/// RSA key pair lifecycle.
pub mod keys;

/// Password digests.
pub mod password;

/// Peer-credential checks for the local administrative socket.
pub mod peer_cred;

/// In-memory session table.
pub mod session;

pub use body::BodyKeys;
pub use credential::SecretKey;
pub use envelope::{AuthHeader, ForwardAgent, ForwardType, OCS_AGENT_HEADER, OCS_HEADER};
pub use error::{Result, SecurityError};
pub use keys::AgentKeyPair;
pub use peer_cred::PeerPolicy;
pub use rsa::RsaPublicKey;
pub use session::{Session, SessionManager};
