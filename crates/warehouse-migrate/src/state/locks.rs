//! Per-idempotency-key execution locks.
//!
//! The invariant "at most one TaskRun is RUNNING for a given key" is
//! enforced here rather than relied on by convention: a lock is acquired
//! before an attempt starts and held until the attempt's final state
//! transition is recorded, sequencing all StateStore writes for that key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of one async mutex per idempotency key.
///
/// Keys are scoped to (table, window, stage), so pipelines for different
/// tables never contend on each other's locks.
#[derive(Default)]
pub struct KeyLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if an attempt is in flight.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("key lock registry poisoned");
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Try to acquire without waiting; `None` means an attempt holds it.
    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.inner.lock().expect("key lock registry poisoned");
            map.entry(key.to_string()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}
