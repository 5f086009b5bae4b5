// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Password digests.
//!
//! Agents never persist cleartext passwords. The stored form is the hex
//! SHA-256 of the password, and comparisons run in constant time over the
//! digest bytes.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of `password`.
pub fn digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether `candidate` hashes to `stored_digest`.
pub fn verify(candidate: &str, stored_digest: &str) -> bool {
    constant_time_eq(digest(candidate).as_bytes(), stored_digest.as_bytes())
}

/// Compare two byte strings without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_hex() {
        assert_eq!(
            digest("secret123"),
            "fcf730b6d95236ecd3c9fc2d92d7b6b2bb061514961aec041d6c7a7192f592e4"
        );
        assert_eq!(digest("").len(), 64);
    }

    #[test]
    fn test_verify() {
        let stored = digest("secret123");
        assert!(verify("secret123", &stored));
        assert!(!verify("secret124", &stored));
        assert!(!verify("secret123", "short"));
    }
}
