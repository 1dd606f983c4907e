//! Registry of live spawned threads.
//!
//! A thread enters the registry before its OS thread starts and leaves it
//! when it is synced, joined, auto-joined, disposed or abandoned at
//! shutdown. The registry holds strong handles, so a thread's shared state
//! outlives its last user handle until it leaves.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::handle::{SpawnId, ThreadHandle};

/// Live threads keyed by id.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<FxHashMap<SpawnId, ThreadHandle>>,
}

impl ThreadRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless `limit` threads are already registered. On refusal the
    /// limit is returned.
    pub(crate) fn try_insert(
        &self,
        handle: ThreadHandle,
        limit: Option<usize>,
    ) -> Result<(), usize> {
        let mut threads = self.threads.lock();
        match limit {
            Some(limit) if threads.len() >= limit => Err(limit),
            _ => {
                threads.insert(handle.id(), handle);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, id: SpawnId) -> Option<ThreadHandle> {
        self.threads.lock().remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<ThreadHandle> {
        let mut threads: Vec<_> = self.threads.lock().drain().map(|(_, h)| h).collect();
        threads.sort_by_key(ThreadHandle::id);
        threads
    }

    /// Look up a registered thread.
    #[must_use]
    pub fn get(&self, id: SpawnId) -> Option<ThreadHandle> {
        self.threads.lock().get(&id).cloned()
    }

    /// Whether the thread is still registered.
    #[must_use]
    pub fn contains(&self, id: SpawnId) -> bool {
        self.threads.lock().contains_key(&id)
    }

    /// Number of registered threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no thread is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all registered threads, in spawn order.
    #[must_use]
    pub fn ids(&self) -> Vec<SpawnId> {
        let mut ids: Vec<_> = self.threads.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}
