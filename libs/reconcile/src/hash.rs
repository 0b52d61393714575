//! Content hashes for change detection.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};

/// Deterministic hash of a desired-state fragment.
///
/// Two fragments with the same fields produce the same hash regardless of
/// key order in the source JSON.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash canonical JSON (sorted keys, no whitespace).
    pub fn from_json(json: &serde_json::Value) -> Self {
        Self::from_bytes(canonical_json(json).as_bytes())
    }

    /// Hash the ordered concatenation of several hashes.
    ///
    /// Order matters: callers pass contributions in a stable order.
    pub fn combine<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a ContentHash>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0.as_bytes());
        }
        Self::from_digest(hasher)
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::from_digest(hasher)
    }

    fn from_digest(hasher: Sha256) -> Self {
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // serde_json's string serializer already produces a canonical escape.
    serde_json::Value::String(s.to_string()).to_string()
}

/// Last successfully applied hash per resource.
///
/// Survives across passes for the life of the process. Guarded by its own
/// coarse mutex, separate from any leased lock: the comparison is not the
/// serialization boundary.
#[derive(Debug)]
pub struct AppliedHashes<K> {
    hashes: Mutex<HashMap<K, ContentHash>>,
}

impl<K> Default for AppliedHashes<K> {
    fn default() -> Self {
        Self {
            hashes: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> AppliedHashes<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<ContentHash> {
        self.hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether `hash` differs from what was last applied for `key`.
    pub fn is_changed(&self, key: &K, hash: &ContentHash) -> bool {
        self.get(key).as_ref() != Some(hash)
    }

    /// Record `hash` as applied. Call only after the apply succeeded.
    pub fn mark_applied(&self, key: K, hash: ContentHash) {
        self.hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, hash);
    }

    pub fn forget(&self, key: &K) {
        self.hashes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
