//! Key-value storage used to retain recent [`Tick`](crate::tick::Tick)s per symbol.
//!
//! The [`TickCache`] trait mirrors the small subset of Redis style primitives the
//! `TickCollector` needs (string values with TTL plus capped lists). A networked store can
//! implement the trait; [`InMemoryTickCache`] is provided for single process deployments and
//! tests.

use crate::error::DataError;
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

/// Async key-value store with TTL and list push/trim primitives.
///
/// List indices follow Redis semantics: both bounds are inclusive and negative indices count
/// from the end of the list (`-1` is the last element).
#[async_trait]
pub trait TickCache: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), DataError>;

    /// Get the value at `key`, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, DataError>;

    /// Push `value` onto the head of the list at `key`, returning the new list length.
    async fn lpush(&self, key: &str, value: String) -> Result<usize, DataError>;

    /// Trim the list at `key` so it only contains the elements in `[start, stop]`.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), DataError>;

    /// Return the elements of the list at `key` in `[start, stop]`.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, DataError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), DataError>;

    /// Reclaim expired values, returning how many were removed. Stores with native expiry
    /// keep the default no-op.
    async fn purge_expired(&self) -> Result<usize, DataError> {
        Ok(0)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: FnvHashMap<String, Entry>,
    lists: FnvHashMap<String, VecDeque<String>>,
}

/// Process local [`TickCache`].
///
/// Expired values are hidden on read and reclaimed by [`InMemoryTickCache::evict_expired`].
#[derive(Debug, Default)]
pub struct InMemoryTickCache {
    inner: RwLock<Inner>,
}

impl InMemoryTickCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired value, returning how many were reclaimed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let before = inner.values.len();
        inner.values.retain(|_, entry| !entry.is_expired(now));
        before - inner.values.len()
    }

    /// Number of live (non-expired) values.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .values
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve inclusive Redis style `[start, stop]` indices against a list of length `len`.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[async_trait]
impl TickCache for InMemoryTickCache {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), DataError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.write().values.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DataError> {
        let now = Instant::now();
        Ok(self
            .inner
            .read()
            .values
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn lpush(&self, key: &str, value: String) -> Result<usize, DataError> {
        let mut inner = self.inner.write();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        Ok(list.len())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), DataError> {
        let mut inner = self.inner.write();
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(());
        };

        match resolve_range(list.len(), start, stop) {
            Some((start, stop)) => {
                list.truncate(stop + 1);
                list.drain(..start);
            }
            None => {
                inner.lists.remove(key);
            }
        }
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, DataError> {
        let inner = self.inner.read();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };

        Ok(match resolve_range(list.len(), start, stop) {
            Some((start, stop)) => list.range(start..=stop).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn ping(&self) -> Result<(), DataError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, DataError> {
        Ok(self.evict_expired())
    }
}
