// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the security envelope.

use thiserror::Error;

/// Errors raised while encoding or verifying the security envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecurityError {
    /// RSA key generation, parsing or encoding failed.
    #[error("RSA key error: {0}")]
    Key(String),

    /// The authentication header could not be decoded or decrypted.
    #[error("failed to decrypt authentication header: {0}")]
    HeaderDecrypt(String),

    /// The header `Uri` does not match the request URI.
    #[error("header uri '{header}' does not match request uri '{request}'")]
    UriMismatch {
        /// URI carried inside the header.
        header: String,
        /// URI of the received request.
        request: String,
    },

    /// The header `Ts` is in the past.
    #[error("authentication header expired at {expired_at}")]
    Expired {
        /// Expiry timestamp carried by the header (unix seconds).
        expired_at: i64,
    },

    /// Body encryption or decryption failed.
    #[error("body cipher error: {0}")]
    BodyCipher(String),

    /// Credential passphrase encryption or decryption failed.
    #[error("credential cipher error: {0}")]
    CredentialCipher(String),

    /// The session does not exist.
    #[error("session '{0}' is invalid")]
    SessionInvalid(String),

    /// The session existed but its expiry passed.
    #[error("session '{0}' has expired")]
    SessionExpired(String),

    /// The peer on the local socket is not allowed to talk to the agent.
    #[error("permission denied for uid {uid}")]
    PermissionDenied {
        /// UID presented by the peer.
        uid: u32,
    },
}

/// Result type using SecurityError.
pub type Result<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_error_display() {
        let err = SecurityError::UriMismatch {
            header: "/api/v1/a".to_string(),
            request: "/api/v1/b".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "header uri '/api/v1/a' does not match request uri '/api/v1/b'"
        );

        let err = SecurityError::PermissionDenied { uid: 1001 };
        assert_eq!(err.to_string(), "permission denied for uid 1001");
    }
}
