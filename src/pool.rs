//! Bounded worker pool for background jobs
//!
//! Submission never waits: when every slot is busy the job is refused with
//! [`Error::PoolDrained`] and the caller decides whether that matters. GC and
//! event handlers log the refusal and retry on their next tick.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Run `job` on a free slot, or fail immediately if none is free
    pub fn try_submit<F>(&self, job: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| Error::PoolDrained(self.name.to_string()))?;
        Ok(tokio::spawn(async move {
            job.await;
            drop(permit);
        }))
    }

    /// Jobs currently running
    pub fn running(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
