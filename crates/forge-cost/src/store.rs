use async_trait::async_trait;
use forge_core::{ForgeError, ForgeResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Longest list kept under one key; pushing past it drops the oldest items.
pub const MAX_LIST_LEN: usize = 1000;

/// Shared key-value store behind the response cache, the cost ledger and the
/// routing log.
///
/// Implementations must make [`incr_by_float`](KeyValueStore::incr_by_float)
/// and [`push`](KeyValueStore::push) atomic, since many runs write to the same
/// keys concurrently.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> ForgeResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> ForgeResult<()>;
    /// Sets a value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ForgeResult<()>;
    /// Adds `delta` to the number stored at `key` (missing counts as 0) and
    /// returns the new value.
    async fn incr_by_float(&self, key: &str, delta: f64) -> ForgeResult<f64>;
    /// Appends to the list at `key`, keeping at most [`MAX_LIST_LEN`] items.
    async fn push(&self, key: &str, value: &str) -> ForgeResult<()>;
    /// The list at `key`, oldest first.
    async fn range(&self, key: &str) -> ForgeResult<Vec<String>>;
    /// Every live scalar key starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> ForgeResult<Vec<String>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, Vec<String>>,
}

/// Process-local [`KeyValueStore`]. Expired entries are dropped on read, and
/// swept from the whole map on every `set_ex` and prefix scan.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> ForgeResult<Option<String>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.values.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> ForgeResult<()> {
        self.inner.lock().values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ForgeResult<()> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.values.retain(|_, e| e.is_live(now));
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> ForgeResult<f64> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let current = match inner.values.get(key) {
            Some(entry) if entry.is_live(now) => entry
                .value
                .parse::<f64>()
                .map_err(|e| ForgeError::Store(format!("value at '{key}' is not a float: {e}")))?,
            _ => 0.0,
        };
        let next = current + delta;
        let expires_at = inner.values.get(key).and_then(|e| e.expires_at);
        inner.values.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn push(&self, key: &str, value: &str) -> ForgeResult<()> {
        let mut inner = self.inner.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        if list.len() > MAX_LIST_LEN {
            let excess = list.len() - MAX_LIST_LEN;
            list.drain(..excess);
        }
        Ok(())
    }

    async fn range(&self, key: &str) -> ForgeResult<Vec<String>> {
        Ok(self.inner.lock().lists.get(key).cloned().unwrap_or_default())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> ForgeResult<Vec<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.values.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
