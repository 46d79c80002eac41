use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Length of the digest prefix used for near-match lookups.
pub const PREFIX_LEN: usize = 8;

/// Serializes `value` as compact JSON with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for k in keys {
                sorted.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn request_digest(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

fn exact_key(digest: &str) -> String {
    format!("cache:exact:{digest}")
}

fn prefix_bucket(digest: &str) -> String {
    let prefix = digest.get(..PREFIX_LEN).unwrap_or(digest);
    format!("cache:semantic:{prefix}:")
}

/// How a cached response was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMatch {
    Exact,
    Prefix,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub payload: String,
    pub matched: CacheMatch,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    seq: u64,
    written_at: DateTime<Utc>,
    payload: String,
}

/// Content-addressed response cache.
///
/// Each write lands under an exact key and a prefix bucket. Reads prefer the
/// exact key and fall back to the most recently written entry sharing the
/// digest prefix. Payloads are opaque and returned byte-for-byte. Store
/// failures are logged and read as misses.
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    seq: AtomicU64,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, digest: &str) -> Option<CacheHit> {
        match self.store.get(&exact_key(digest)).await {
            Ok(Some(raw)) => {
                if let Some(entry) = decode(&raw) {
                    info!(digest = %short(digest), "Cache hit: exact match");
                    return Some(CacheHit {
                        payload: entry.payload,
                        matched: CacheMatch::Exact,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Cache lookup failed");
                return None;
            }
        }

        let keys = match self.store.keys_with_prefix(&prefix_bucket(digest)).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "Cache prefix scan failed");
                return None;
            }
        };

        let mut newest: Option<CacheEntry> = None;
        for key in keys {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, key = %key, "Cache lookup failed");
                    continue;
                }
            };
            let Some(entry) = decode(&raw) else { continue };
            let is_newer = newest
                .as_ref()
                .map_or(true, |n| (entry.written_at, entry.seq) > (n.written_at, n.seq));
            if is_newer {
                newest = Some(entry);
            }
        }

        newest.map(|entry| {
            info!(digest = %short(digest), "Cache hit: prefix match");
            CacheHit {
                payload: entry.payload,
                matched: CacheMatch::Prefix,
            }
        })
    }

    pub async fn put(&self, digest: &str, payload: &str, ttl: Duration) {
        let entry = CacheEntry {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            written_at: Utc::now(),
            payload: payload.to_string(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Cache entry serialization failed");
                return;
            }
        };

        let bucket_key = format!("{}{digest}", prefix_bucket(digest));
        for key in [exact_key(digest), bucket_key] {
            if let Err(e) = self.store.set_ex(&key, &raw, ttl).await {
                error!(error = %e, key = %key, "Cache write failed");
            }
        }
        debug!(digest = %short(digest), ttl_secs = ttl.as_secs(), "Cached response");
    }
}

fn decode(raw: &str) -> Option<CacheEntry> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            error!(error = %e, "Corrupt cache entry");
            None
        }
    }
}

fn short(digest: &str) -> &str {
    digest.get(..PREFIX_LEN).unwrap_or(digest)
}
