//! Shared key-value store interface.
//!
//! Snapshots and lease records live in a store every service instance can
//! reach. Each method is a single atomic operation on one key; nothing here
//! spans keys, so a value that must change as a unit has to be one record.

use crate::error::{FaceMatchError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get a live (non-expired) value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value under `key` in one step; readers see the old or the new value.
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete a key. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Store `value` with a time-to-live only if no live value exists.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its live value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Keys with live values that start with `prefix`, sorted.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

impl fmt::Debug for dyn KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KvStore {{ ... }}")
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-memory store. Clones share the same data, so several matchers built on
/// clones of one `MemoryKv` behave like service instances sharing a server.
#[derive(Clone, Default)]
pub struct MemoryKv {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| FaceMatchError::StorageError(e.to_string()))?;
        Ok(f(&mut data))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        self.with_data(|data| {
            data.get(key)
                .filter(|e| e.is_live(now))
                .map(|e| e.value.clone())
        })
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.with_data(|data| {
            data.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: None,
                },
            );
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        self.with_data(|data| data.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        self.with_data(|data| {
            if data.get(key).is_some_and(|e| e.is_live(now)) {
                return false;
            }
            data.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        })
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        self.with_data(|data| {
            let matches = data
                .get(key)
                .is_some_and(|e| e.is_live(now) && e.value == expected);
            if matches {
                data.remove(key);
            }
            matches
        })
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        self.with_data(|data| {
            let mut keys: Vec<String> = data
                .iter()
                .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            keys
        })
    }
}
