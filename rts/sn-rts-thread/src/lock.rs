//! Lock table backing the `lock(var) => { ... }` block.
//!
//! Each locked variable gets its own mutex, created on first use and kept
//! until the whole table is cleared. Locks are plain and non-reentrant:
//! acquiring a lock the current thread already holds deadlocks.

use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHasher;
use sn_rts_region::Handle;
use thiserror::Error;
use tracing::{error, trace};

/// Identity of a lockable variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A variable stored as a region object.
    Handle(Handle),
    /// A variable identified by its address, as compiled code passes it.
    Address(usize),
}

impl From<Handle> for LockKey {
    fn from(handle: Handle) -> Self {
        Self::Handle(handle)
    }
}

impl From<usize> for LockKey {
    fn from(address: usize) -> Self {
        Self::Address(address)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "{handle}"),
            Self::Address(address) => write!(f, "{address:#x}"),
        }
    }
}

/// Misuse of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// Release of a variable that was never locked.
    #[error("release of {key}, which was never locked")]
    Unknown {
        /// The variable.
        key: LockKey,
    },
    /// Release of a variable that is not currently locked.
    #[error("release of {key}, which is not locked")]
    NotHeld {
        /// The variable.
        key: LockKey,
    },
}

#[derive(Debug, Default)]
struct LockEntry {
    held: Mutex<bool>,
    released: Condvar,
}

/// Table of per-variable mutexes.
#[derive(Debug, Default)]
pub struct SyncLockTable {
    entries: DashMap<LockKey, Arc<LockEntry>, BuildHasherDefault<FxHasher>>,
}

impl SyncLockTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: LockKey) -> Arc<LockEntry> {
        // Clone out of the map so no shard lock is held while blocking.
        Arc::clone(self.entries.entry(key).or_default().value())
    }

    /// Lock `key`, blocking until it is free.
    pub fn acquire(&self, key: impl Into<LockKey>) {
        let key = key.into();
        let entry = self.entry(key);
        let mut held = entry.held.lock();
        while *held {
            entry.released.wait(&mut held);
        }
        *held = true;
        trace!(%key, "lock acquired");
    }

    /// Lock `key` if it is free. Returns whether the lock was taken.
    pub fn try_acquire(&self, key: impl Into<LockKey>) -> bool {
        let key = key.into();
        let entry = self.entry(key);
        let mut held = entry.held.lock();
        if *held {
            return false;
        }
        *held = true;
        true
    }

    /// Unlock `key`.
    pub fn release(&self, key: impl Into<LockKey>) -> Result<(), LockError> {
        let key = key.into();
        let Some(entry) = self.entries.get(&key).map(|e| Arc::clone(e.value())) else {
            error!(%key, "release of a lock that was never acquired");
            return Err(LockError::Unknown { key });
        };
        let mut held = entry.held.lock();
        if !*held {
            error!(%key, "release of a lock that is not held");
            return Err(LockError::NotHeld { key });
        }
        *held = false;
        drop(held);
        entry.released.notify_one();
        trace!(%key, "lock released");
        Ok(())
    }

    /// Lock `key` for the lifetime of the returned guard.
    #[must_use = "the lock is released as soon as the guard is dropped"]
    pub fn lock(&self, key: impl Into<LockKey>) -> LockGuard<'_> {
        let key = key.into();
        self.acquire(key);
        LockGuard { table: self, key }
    }

    /// Whether `key` is currently locked.
    #[must_use]
    pub fn is_locked(&self, key: impl Into<LockKey>) -> bool {
        self.entries
            .get(&key.into())
            .map_or(false, |entry| {
                let held = *entry.held.lock();
                held
            })
    }

    /// Number of variables that have ever been locked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no variable has been locked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry. Only valid when no lock is held.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    table: &'a SyncLockTable,
    key: LockKey,
}

impl LockGuard<'_> {
    /// The locked variable.
    #[must_use]
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let _ = self.table.release(self.key);
    }
}
