//! Matcher configuration.

use crate::error::{FaceMatchError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Embedding dimension produced by the face model.
pub const DEFAULT_DIMENSION: usize = 512;

/// Tunables for the index cache. Every field has a default, so a config file
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Embedding dimension every index is built for.
    pub dimension: usize,
    /// Lease length of a collection lock; a crashed holder blocks others at most this long.
    pub lease_ttl_ms: u64,
    /// How long a mutation waits for a collection lock before giving up.
    pub wait_timeout_ms: u64,
    /// Pause between lock acquisition attempts.
    pub retry_backoff_ms: u64,
    /// Maximum number of concurrent CPU-bound index jobs.
    pub worker_pool_size: usize,
    /// Namespace prepended to every key in the shared store.
    pub key_prefix: String,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            lease_ttl_ms: 30_000,
            wait_timeout_ms: 10_000,
            retry_backoff_ms: 50,
            worker_pool_size: 4,
            key_prefix: "facematch".to_string(),
        }
    }
}

impl MatcherConfig {
    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: MatcherConfig = serde_json::from_slice(&bytes)
            .map_err(|e| FaceMatchError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the matcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(FaceMatchError::ConfigError(
                "dimension must be non-zero".to_string(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(FaceMatchError::ConfigError(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.lease_ttl_ms == 0 || self.retry_backoff_ms == 0 {
            return Err(FaceMatchError::ConfigError(
                "lease_ttl_ms and retry_backoff_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Store key holding the committed snapshot of `collection`.
    pub fn snapshot_key(&self, collection: &str) -> String {
        format!("{}:snapshot:{}", self.key_prefix, collection)
    }

    /// Prefix shared by every snapshot key.
    pub fn snapshot_prefix(&self) -> String {
        format!("{}:snapshot:", self.key_prefix)
    }

    /// Store key holding the lease record of `collection`.
    pub fn lock_key(&self, collection: &str) -> String {
        format!("{}:lock:{}", self.key_prefix, collection)
    }
}
