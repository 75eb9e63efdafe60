//! Bounded per-module backend slots.
//!
//! The hyper client keeps the actual keep-alive connections; a
//! [`ConnectionPool`] caps how many requests may be in flight to one
//! module at a time. A request waits at most `acquire_timeout` for a
//! slot and is turned away otherwise, so a slow backend cannot build an
//! unbounded queue in front of it. The returned permit is held until
//! the relayed response finishes or is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::model::PoolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no backend slot free within {waited_ms}ms")]
pub struct PoolTimeout {
    pub waited_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionPool {
    slots: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.max_connections,
            Duration::from_millis(config.acquire_timeout),
        )
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolTimeout> {
        let waited_ms = u64::try_from(self.acquire_timeout.as_millis()).unwrap_or(u64::MAX);
        match tokio::time::timeout(self.acquire_timeout, Arc::clone(&self.slots).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed; treat it like exhaustion anyway.
            Ok(Err(_)) | Err(_) => Err(PoolTimeout { waited_ms }),
        }
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
