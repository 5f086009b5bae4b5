// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stored credential encryption.
//!
//! Passphrases are sealed with AES-256-GCM under a 32-byte cluster key. The
//! stored form is `base64(nonce || ciphertext)`. The cluster key itself is
//! kept in the configuration table encoded with a Base64 alphabet rotated by
//! [`CAESAR_SHIFT`] positions.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{PAD, STANDARD};
use base64::engine::GeneralPurpose;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Result, SecurityError};

/// Cluster key length in bytes.
pub const SECRET_KEY_LEN: usize = 32;

/// GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Rotation applied to the standard Base64 alphabet.
pub const CAESAR_SHIFT: usize = 7;

const STANDARD_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// A 32-byte cluster key for passphrase encryption.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Zeroizing<[u8; SECRET_KEY_LEN]>);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    /// Random key.
    pub fn generate() -> Self {
        let mut raw = [0u8; SECRET_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        Self(Zeroizing::new(raw))
    }

    /// Build from raw bytes; must be exactly 32 bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let arr: [u8; SECRET_KEY_LEN] = raw.try_into().map_err(|_| {
            SecurityError::CredentialCipher(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LEN,
                raw.len()
            ))
        })?;
        Ok(Self(Zeroizing::new(arr)))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Caesar-Base64 form stored in the configuration table.
    pub fn to_stored(&self) -> Result<String> {
        caesar_encode(self.as_bytes())
    }

    /// Parse the stored configuration value.
    pub fn from_stored(stored: &str) -> Result<Self> {
        let raw = Zeroizing::new(caesar_decode(stored)?);
        Self::from_bytes(&raw)
    }

    /// Encrypt a passphrase.
    pub fn encrypt(&self, plain: &str) -> Result<String> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|e| SecurityError::CredentialCipher(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a stored passphrase.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let raw = STANDARD
            .decode(stored)
            .map_err(|e| SecurityError::CredentialCipher(e.to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(SecurityError::CredentialCipher(
                "ciphertext too short".to_string(),
            ));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| SecurityError::CredentialCipher(e.to_string()))?;
        String::from_utf8(plain).map_err(|e| SecurityError::CredentialCipher(e.to_string()))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.as_bytes())
            .map_err(|e| SecurityError::CredentialCipher(e.to_string()))
    }
}

fn caesar_engine() -> Result<GeneralPurpose> {
    let rotated: String = STANDARD_ALPHABET[CAESAR_SHIFT..]
        .chars()
        .chain(STANDARD_ALPHABET[..CAESAR_SHIFT].chars())
        .collect();
    let alphabet =
        Alphabet::new(&rotated).map_err(|e| SecurityError::CredentialCipher(e.to_string()))?;
    Ok(GeneralPurpose::new(&alphabet, PAD))
}

/// Encode bytes with the rotated Base64 alphabet.
pub fn caesar_encode(raw: &[u8]) -> Result<String> {
    Ok(caesar_engine()?.encode(raw))
}

/// Decode bytes encoded by [`caesar_encode`].
pub fn caesar_decode(encoded: &str) -> Result<Vec<u8>> {
    caesar_engine()?
        .decode(encoded.trim())
        .map_err(|e| SecurityError::CredentialCipher(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_round_trip() {
        let key = SecretKey::generate();
        for pwd in ["", "p1", "Pässwörd-🙂", &"x".repeat(512)] {
            let sealed = key.encrypt(pwd).unwrap();
            assert_eq!(key.decrypt(&sealed).unwrap(), pwd);
        }
    }

    #[test]
    fn test_each_encryption_uses_fresh_nonce() {
        let key = SecretKey::generate();
        assert_ne!(key.encrypt("same").unwrap(), key.encrypt("same").unwrap());
    }

    #[test]
    fn test_other_key_cannot_decrypt() {
        let old = SecretKey::generate();
        let new = SecretKey::generate();
        let sealed = old.encrypt("p1").unwrap();
        assert!(matches!(
            new.decrypt(&sealed),
            Err(SecurityError::CredentialCipher(_))
        ));
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(SecretKey::from_bytes(&[0u8; 16]).is_err());
        assert!(SecretKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_stored_key_is_not_plain_base64() {
        let key = SecretKey::from_bytes(&[0x42u8; 32]).unwrap();
        let stored = key.to_stored().unwrap();
        assert_ne!(stored, STANDARD.encode(key.as_bytes()));
        assert_eq!(SecretKey::from_stored(&stored).unwrap(), key);
    }

    #[test]
    fn test_caesar_shift_maps_first_symbol() {
        // 0b000000 is 'A' in the standard alphabet, shifted by seven
        assert_eq!(caesar_encode(&[0, 0, 0]).unwrap(), "HHHH");
        assert_eq!(caesar_decode("HHHH").unwrap(), vec![0, 0, 0]);
    }
}
