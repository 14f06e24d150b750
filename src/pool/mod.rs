//! Bounded pool of reusable floating IP identifiers.
//!
//! A flight owns one pool. Machines take an identifier when one is free and
//! hand it back on teardown. Acquisition never waits: an empty pool means the
//! provider allocates a fresh address instead. Every operation happens under
//! one lock, so an identifier is never handed to two callers and a free entry
//! is never missed by a concurrent acquire.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{info, warn};

use crate::provider::{Provider, ProviderError};

/// Errors raised when returning an identifier to the pool.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    /// Raised when a release would exceed the pool capacity.
    #[error("pool at capacity {capacity}; cannot release {id}")]
    Full {
        /// Identifier that could not be returned.
        id: String,
        /// Capacity fixed at construction.
        capacity: usize,
    },
    /// Raised when the pool has already been drained.
    #[error("pool is closed; cannot release {id}")]
    Closed {
        /// Identifier that could not be returned.
        id: String,
    },
}

impl PoolError {
    /// Identifier the failed release carried.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Full { id, .. } | Self::Closed { id } => id,
        }
    }
}

/// Outcome of [`ResourcePool::drain_and_destroy`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DrainReport {
    /// Identifiers deleted through the provider.
    pub deleted: Vec<String>,
    /// Identifiers whose deletion failed, with the provider error.
    pub failed: Vec<(String, ProviderError)>,
}

impl DrainReport {
    /// Returns `true` when every identifier was deleted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Deletes each identifier through `provider`, recording the outcome.
    pub(crate) async fn delete_each(&mut self, provider: &dyn Provider, ids: Vec<String>) {
        for id in ids {
            match provider.delete_floating_ip(&id).await {
                Ok(()) => {
                    info!(floating_ip = %id, "deleted floating IP");
                    self.deleted.push(id);
                }
                Err(err) => {
                    warn!(floating_ip = %id, error = %err, "failed to delete floating IP");
                    self.failed.push((id, err));
                }
            }
        }
    }
}

#[derive(Debug)]
struct PoolState {
    available: VecDeque<String>,
    closed: bool,
}

/// Fixed-capacity, concurrency-safe set of floating IP identifiers.
///
/// Capacity is the backend's known quota ceiling. It bounds available plus
/// checked-out identifiers, so a release of something previously acquired
/// always fits.
#[derive(Debug)]
pub struct ResourcePool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    /// Creates an empty pool with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                available: VecDeque::with_capacity(capacity),
                closed: false,
            }),
        }
    }

    /// Capacity fixed at construction.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of identifiers currently available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock().available.len()
    }

    /// Snapshot of the identifiers currently available, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lock().available.iter().cloned().collect()
    }

    /// Returns `true` once the pool has been drained.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Takes an identifier if one is immediately available.
    ///
    /// Never blocks on an empty pool and returns `None` once closed.
    #[must_use]
    pub fn try_acquire(&self) -> Option<String> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.available.pop_front()
    }

    /// Returns an identifier to the pool without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after the pool has been drained and
    /// [`PoolError::Full`] when the capacity invariant would be violated. The
    /// caller still owns the identifier in both cases.
    pub fn release(&self, id: impl Into<String>) -> Result<(), PoolError> {
        let owned = id.into();
        let mut state = self.lock();
        if state.closed {
            return Err(PoolError::Closed { id: owned });
        }
        if state.available.len() >= self.capacity {
            warn!(floating_ip = %owned, capacity = self.capacity, "pool capacity exceeded");
            return Err(PoolError::Full {
                id: owned,
                capacity: self.capacity,
            });
        }
        state.available.push_back(owned);
        Ok(())
    }

    /// Closes the pool to further releases and deletes every remaining
    /// identifier through `provider`.
    ///
    /// Per-identifier failures are collected in the report and do not stop
    /// the drain.
    pub async fn drain_and_destroy(&self, provider: &dyn Provider) -> DrainReport {
        let remaining: Vec<String> = {
            let mut state = self.lock();
            state.closed = true;
            state.available.drain(..).collect()
        };

        let mut report = DrainReport::default();
        report.delete_each(provider, remaining).await;
        report
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests;
