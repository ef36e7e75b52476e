//! Ed25519 signing of evidence bundles.
//!
//! The private key is read once from an owner-only file and lives in
//! process memory for the lifetime of the agent. Key material is never
//! logged, never emitted in errors, and never transmitted.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use zeroize::Zeroize;

use crate::util::fs::ensure_owner_only;

pub struct EvidenceSigner {
    key: SigningKey,
}

impl EvidenceSigner {
    /// Load the signing key. Accepts 32 raw bytes or 64 hex characters.
    pub fn load(path: &Path) -> Result<Self> {
        ensure_owner_only(path)?;
        let mut raw = fs::read(path)
            .with_context(|| format!("failed to read signing key {}", path.display()))?;

        let result = Self::from_key_bytes(&raw);
        raw.zeroize();
        result.with_context(|| format!("invalid signing key in {}", path.display()))
    }

    fn from_key_bytes(raw: &[u8]) -> Result<Self> {
        let mut seed = [0u8; 32];
        if raw.len() == 32 {
            seed.copy_from_slice(raw);
        } else {
            let text = std::str::from_utf8(raw)
                .map_err(|_| anyhow!("key is neither 32 raw bytes nor hex"))?;
            let mut decoded =
                hex::decode(text.trim()).map_err(|_| anyhow!("key is not valid hex"))?;
            if decoded.len() != 32 {
                decoded.zeroize();
                return Err(anyhow!("hex key must decode to 32 bytes"));
            }
            seed.copy_from_slice(&decoded);
            decoded.zeroize();
        }
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(EvidenceSigner { key })
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.key.sign(message)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}
