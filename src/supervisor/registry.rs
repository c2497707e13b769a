//! Exclusive bookkeeping of live worker handles.
//!
//! [`ProcessRegistry`] holds at most one [`WorkerHandle`] per stream id. It
//! wraps a `HashMap` behind `Arc<Mutex<..>>` so start, stop, status and the
//! background monitors can share it.
//!
//! **Concurrency model:** the mutex guards map mutation only and is never
//! held across an await. Handles leave the map by value (`remove`,
//! `take_exited`, `take_all`) before anything slow -- termination, draining
//! diagnostics -- happens to them, so whoever removed a handle is its sole
//! owner.
//!
//! No process control lives here beyond the non-blocking exit poll done when
//! taking a snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::handle::WorkerHandle;
use super::types::{HandleSnapshot, StreamId};

/// Returned by [`ProcessRegistry::register`] when the id is taken. Carries
/// the rejected handle back so the caller can terminate it.
#[derive(Debug)]
pub struct Occupied(pub WorkerHandle);

impl std::fmt::Display for Occupied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream {} already has a registered worker", self.0.stream_id())
    }
}

impl std::error::Error for Occupied {}

#[derive(Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<StreamId, WorkerHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under `id`. Fails if the id is already present;
    /// use [`replace`](Self::replace) to displace an existing handle.
    pub fn register(&self, id: &str, handle: WorkerHandle) -> Result<(), Occupied> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return Err(Occupied(handle));
        }
        entries.insert(id.to_string(), handle);
        Ok(())
    }

    /// Register a handle under `id`, returning the displaced one. The caller
    /// owns the returned handle and must confirm it terminated.
    #[must_use = "a displaced handle must be terminated, not dropped"]
    pub fn replace(&self, id: &str, handle: WorkerHandle) -> Option<WorkerHandle> {
        self.lock().insert(id.to_string(), handle)
    }

    /// Snapshot of the handle registered under `id`.
    pub fn lookup(&self, id: &str) -> Option<HandleSnapshot> {
        self.lock().get_mut(id).map(WorkerHandle::snapshot)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Remove and return the handle registered under `id`.
    pub fn remove(&self, id: &str) -> Option<WorkerHandle> {
        self.lock().remove(id)
    }

    /// Remove the handle under `id` only if its process has exited.
    pub fn take_exited(&self, id: &str) -> Option<WorkerHandle> {
        let mut entries = self.lock();
        let exited = entries
            .get_mut(id)
            .is_some_and(|h| h.poll_exit().is_some());
        if exited { entries.remove(id) } else { None }
    }

    /// Snapshots of every registered handle, sorted by stream id.
    pub fn list(&self) -> Vec<HandleSnapshot> {
        let mut snapshots: Vec<_> = self
            .lock()
            .values_mut()
            .map(WorkerHandle::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        snapshots
    }

    /// Registered stream ids, sorted.
    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drain the registry. Used at shutdown.
    pub fn take_all(&self) -> Vec<(StreamId, WorkerHandle)> {
        self.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, WorkerHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
