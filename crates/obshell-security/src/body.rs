// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AES-128-CBC request body codec.
//!
//! The key and IV travel in the `Keys` field of the authentication header,
//! so only the holder of the agent's private key can read the body.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;

use crate::error::{Result, SecurityError};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES key length in bytes.
pub const KEY_LEN: usize = 16;

/// CBC IV length in bytes.
pub const IV_LEN: usize = 16;

/// AES key and IV for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl BodyKeys {
    /// Random key and IV.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Build from raw parts.
    pub fn from_parts(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Base64 of key followed by IV, as carried in the header.
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(KEY_LEN + IV_LEN);
        raw.extend_from_slice(&self.key);
        raw.extend_from_slice(&self.iv);
        STANDARD.encode(raw)
    }

    /// Parse the header `Keys` field.
    pub fn decode(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| SecurityError::BodyCipher(e.to_string()))?;
        if raw.len() != KEY_LEN + IV_LEN {
            return Err(SecurityError::BodyCipher(format!(
                "expected {} key bytes, got {}",
                KEY_LEN + IV_LEN,
                raw.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&raw[..KEY_LEN]);
        iv.copy_from_slice(&raw[KEY_LEN..]);
        Ok(Self { key, iv })
    }

    /// Encrypt a body and base64 encode the ciphertext.
    pub fn encrypt(&self, plain: &[u8]) -> String {
        let cipher = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain);
        STANDARD.encode(cipher)
    }

    /// Decrypt a base64 body.
    pub fn decrypt(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        let trimmed = trim_ascii(encoded);
        let cipher = STANDARD
            .decode(trimmed)
            .map_err(|e| SecurityError::BodyCipher(e.to_string()))?;
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&cipher)
            .map_err(|e| SecurityError::BodyCipher(e.to_string()))
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let bytes = match bytes.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &bytes[start..],
        None => return &[],
    };
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    // JSON clients may wrap the ciphertext in quotes
    let bytes = &bytes[..end];
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        &bytes[1..bytes.len() - 1]
    } else {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_then_decrypt() {
        let keys = BodyKeys::generate();
        let body = br#"{"dag_id":"11","operator":"RETRY"}"#;
        let cipher = keys.encrypt(body);
        assert_eq!(keys.decrypt(cipher.as_bytes()).unwrap(), body.to_vec());
    }

    #[test]
    fn test_decrypt_accepts_quoted_ciphertext() {
        let keys = BodyKeys::from_parts([7u8; 16], [9u8; 16]);
        let cipher = format!("\"{}\"\n", keys.encrypt(b"hello"));
        assert_eq!(keys.decrypt(cipher.as_bytes()).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn test_wrong_keys_fail() {
        let keys = BodyKeys::from_parts([1u8; 16], [2u8; 16]);
        let other = BodyKeys::from_parts([3u8; 16], [2u8; 16]);
        let cipher = keys.encrypt(b"some body that spans more than one block");
        // Padding check rejects almost every wrong key; accept a garbled success too.
        if let Ok(plain) = other.decrypt(cipher.as_bytes()) {
            assert_ne!(plain, b"some body that spans more than one block".to_vec());
        }
    }

    #[test]
    fn test_decode_rejects_short_keys() {
        let short = STANDARD.encode([0u8; 20]);
        assert!(matches!(
            BodyKeys::decode(&short),
            Err(SecurityError::BodyCipher(_))
        ));
    }
}
