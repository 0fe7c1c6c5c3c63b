//! Content fingerprints and cache-key derivation.
//!
//! Keys and fingerprints are sha256 digests over a length-prefixed encoding, so
//! two distinct field sequences can never produce the same byte stream.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{Batch, WorkItem};

pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in pairs {
                out.insert(key.clone(), canonicalize_json(val));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}

pub fn compute_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Digest of a JSON value independent of object key order.
pub fn json_digest(value: &Value) -> String {
    let canon = canonicalize_json(value);
    let bytes = serde_json::to_vec(&canon).unwrap_or_default();
    compute_digest(&bytes)
}

fn update_field(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field);
}

/// Derives cache keys for items and batches.
///
/// A key identifies *what* is being asked (namespace, operation parameters and
/// the unit's identity) but not the unit's content; the content fingerprint is
/// checked separately on lookup so that edited content invalidates its entry.
#[derive(Debug, Clone)]
pub struct CacheKeyer {
    namespace: String,
    params_digest: String,
}

impl CacheKeyer {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            params_digest: json_digest(&Value::Null),
        }
    }

    /// Mix operation parameters (model, prompt version, ...) into every key.
    pub fn with_params(mut self, params: &Value) -> Self {
        self.params_digest = json_digest(params);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn scoped(&self, kind: &[u8]) -> Sha256 {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, kind);
        update_field(&mut hasher, self.namespace.as_bytes());
        update_field(&mut hasher, self.params_digest.as_bytes());
        hasher
    }

    pub fn item_key(&self, item: &WorkItem) -> String {
        let mut hasher = self.scoped(b"item");
        update_field(&mut hasher, item.source_identity.as_bytes());
        update_field(&mut hasher, item.id.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn batch_key(&self, batch: &Batch) -> String {
        let mut hasher = self.scoped(b"batch");
        hasher.update((batch.items.len() as u64).to_le_bytes());
        for item in &batch.items {
            update_field(&mut hasher, item.source_identity.as_bytes());
            update_field(&mut hasher, item.id.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Combined fingerprint of a batch's members, in order.
    pub fn batch_fingerprint(batch: &Batch) -> String {
        let mut hasher = Sha256::new();
        hasher.update((batch.items.len() as u64).to_le_bytes());
        for item in &batch.items {
            update_field(&mut hasher, item.content_fingerprint.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl Default for CacheKeyer {
    fn default() -> Self {
        Self::new("batchwise")
    }
}
