//! Inbound order verification: signature, TTL, replay.
//!
//! The checks run in a fixed order and short-circuit; every rejection maps
//! to an evidence outcome so that refused orders still leave an audit
//! trail.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use custos_shared::evidence::Outcome;
use custos_shared::order::Order;

use super::nonce::NonceStore;

#[derive(Debug, Error)]
pub enum OrderRejection {
    #[error("ttl_seconds {got} is below the configured minimum {minimum}")]
    TtlTooShort { got: u64, minimum: u64 },
    #[error("signature did not verify against any trusted key")]
    BadSignature,
    #[error("order expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },
    #[error("nonce has already been accepted")]
    Replayed,
    #[error("runbook {runbook_id:?} is not loaded")]
    UnknownRunbook { runbook_id: String },
    #[error("nonce store unavailable: {0}")]
    Storage(String),
}

impl OrderRejection {
    /// Evidence outcome for this rejection.
    pub fn outcome(&self) -> Outcome {
        match self {
            OrderRejection::Expired { .. } => Outcome::Expired,
            _ => Outcome::Rejected,
        }
    }
}

struct TrustedKey {
    fingerprint: String,
    key: VerifyingKey,
}

/// Verifies inbound orders against the trusted key set and the durable
/// nonce store.
pub struct OrderVerifier {
    keys: Vec<TrustedKey>,
    nonces: NonceStore,
    ttl_minimum: u64,
}

fn fingerprint(key: &VerifyingKey) -> String {
    hex::encode(&Sha256::digest(key.as_bytes())[..8])
}

impl OrderVerifier {
    /// Load trusted verify keys: one hex-encoded 32-byte public key per
    /// line, `#` comments and blank lines ignored.
    pub fn load(keys_path: &Path, nonces: NonceStore, ttl_minimum: u64) -> Result<Self> {
        let contents = fs::read_to_string(keys_path)
            .with_context(|| format!("failed to read trusted keys {}", keys_path.display()))?;

        let mut keys = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bytes = hex::decode(line)
                .with_context(|| format!("bad hex on line {} of trusted keys", lineno + 1))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow!("trusted key on line {} is not 32 bytes", lineno + 1))?;
            let key = VerifyingKey::from_bytes(&arr)
                .with_context(|| format!("invalid Ed25519 key on line {}", lineno + 1))?;
            keys.push(TrustedKey {
                fingerprint: fingerprint(&key),
                key,
            });
        }
        if keys.is_empty() {
            return Err(anyhow!(
                "no trusted verify keys found in {}",
                keys_path.display()
            ));
        }
        Ok(OrderVerifier {
            keys,
            nonces,
            ttl_minimum,
        })
    }

    /// Ordered, short-circuiting verification. On acceptance the nonce is
    /// recorded before returning.
    pub fn verify(&self, order: &Order, now: DateTime<Utc>) -> Result<(), OrderRejection> {
        if order.ttl_seconds < self.ttl_minimum {
            return Err(OrderRejection::TtlTooShort {
                got: order.ttl_seconds,
                minimum: self.ttl_minimum,
            });
        }

        let message = order
            .canonical_bytes()
            .map_err(|e| OrderRejection::Storage(e.to_string()))?;
        let sig_bytes = BASE64
            .decode(order.signature.as_bytes())
            .map_err(|_| OrderRejection::BadSignature)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| OrderRejection::BadSignature)?;

        let issuer = self
            .keys
            .iter()
            .find(|k| k.key.verify(&message, &signature).is_ok())
            .map(|k| k.fingerprint.clone())
            .ok_or(OrderRejection::BadSignature)?;

        let expires_at = order.expires_at();
        if expires_at < now {
            return Err(OrderRejection::Expired {
                expired_at: expires_at,
            });
        }

        let seen = self
            .nonces
            .seen(&issuer, &order.nonce)
            .map_err(|e| OrderRejection::Storage(e.to_string()))?;
        if seen {
            return Err(OrderRejection::Replayed);
        }

        self.nonces
            .record(&issuer, &order.nonce, now)
            .map_err(|e| OrderRejection::Storage(e.to_string()))?;
        debug!(order_id = %order.order_id, issuer = %issuer, "order accepted");
        Ok(())
    }
}
