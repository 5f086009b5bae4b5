// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RSA key pair used to unwrap authentication headers.
//!
//! Each agent generates a 2048-bit key pair on first boot, keeps the private
//! half in its local store and hands out the public half on the
//! unauthenticated `GET /api/v1/secret` endpoint.
//!
//! PKCS#1 v1.5 can only wrap `modulus - 11` bytes per block, so payloads are
//! split into blocks and the ciphertext blocks are concatenated.

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use crate::error::{Result, SecurityError};

/// Modulus size for freshly generated agent keys.
pub const AGENT_KEY_BITS: usize = 2048;

/// PKCS#1 v1.5 padding overhead per block.
const PKCS1_OVERHEAD: usize = 11;

/// An agent's RSA key pair.
#[derive(Clone)]
pub struct AgentKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl std::fmt::Debug for AgentKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKeyPair")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

impl AgentKeyPair {
    /// Generate a fresh 2048-bit key pair.
    pub fn generate() -> Result<Self> {
        Self::generate_with_bits(AGENT_KEY_BITS)
    }

    /// Generate a key pair with an explicit modulus size.
    pub fn generate_with_bits(bits: usize) -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private =
            RsaPrivateKey::new(&mut rng, bits).map_err(|e| SecurityError::Key(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Restore a key pair from a PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private =
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| SecurityError::Key(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Encode the private key as PKCS#8 PEM.
    pub fn private_pem(&self) -> Result<Zeroizing<String>> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| SecurityError::Key(e.to_string()))
    }

    /// Encode the public key as SPKI PEM.
    pub fn public_pem(&self) -> Result<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| SecurityError::Key(e.to_string()))
    }

    /// The public half.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Decrypt a concatenation of PKCS#1 v1.5 blocks.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let block = self.private.size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(SecurityError::HeaderDecrypt(format!(
                "ciphertext length {} is not a multiple of {}",
                ciphertext.len(),
                block
            )));
        }

        let mut plain = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(block) {
            let part = self
                .private
                .decrypt(Pkcs1v15Encrypt, chunk)
                .map_err(|e| SecurityError::HeaderDecrypt(e.to_string()))?;
            plain.extend_from_slice(&part);
        }
        Ok(plain)
    }
}

/// Parse a peer's SPKI PEM public key.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| SecurityError::Key(e.to_string()))
}

/// Encrypt `plaintext` for the holder of `public`, block by block.
pub fn encrypt_for(public: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let block = public.size() - PKCS1_OVERHEAD;
    let mut rng = rand::rngs::OsRng;
    let mut out = Vec::with_capacity(plaintext.len().div_ceil(block) * public.size());
    for chunk in plaintext.chunks(block) {
        let part = public
            .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| SecurityError::Key(e.to_string()))?;
        out.extend_from_slice(&part);
    }
    Ok(out)
}
