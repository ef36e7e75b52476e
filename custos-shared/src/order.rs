//! Orders produced by the coordinator and consumed by the agent.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Scalar order parameter. Orders never carry nested structures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// A signed instruction to execute one runbook.
///
/// The `signature` is a detached Ed25519 signature (base64) over the
/// canonical JSON of the order with the `signature` field removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub runbook_id: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub signature: String,
}

impl Order {
    /// Canonical bytes the coordinator signed: the order without `signature`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("signature");
        }
        serde_json::to_vec(&value)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.ttl_seconds as i64)
    }
}

/// Body of `GET /api/orders/pending`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PendingOrdersResponse {
    #[serde(default)]
    pub orders: Vec<Order>,
}
