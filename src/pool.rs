//! Bounded pool for CPU-bound index work.
//!
//! Jobs run on tokio's blocking threads so vector math never stalls the
//! request-handling tasks; a semaphore caps how many run at once.

use crate::error::{FaceMatchError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct ComputePool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl ComputePool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread once a slot is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| FaceMatchError::Internal(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| FaceMatchError::Internal(format!("compute job failed: {}", e)))
    }
}
