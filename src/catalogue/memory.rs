//! In-process catalogue for embedding and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Catalogue, StreamDescriptor, StreamLogEntry};
use crate::error::CatalogueError;
use crate::supervisor::types::{StreamId, StreamRuntimeState};

#[derive(Default)]
struct Tables {
    descriptors: HashMap<StreamId, StreamDescriptor>,
    statuses: HashMap<StreamId, StreamRuntimeState>,
    /// Every status write in order, for auditing transitions.
    status_history: Vec<(StreamId, StreamRuntimeState)>,
    pids: HashMap<StreamId, u32>,
    logs: Vec<StreamLogEntry>,
}

/// A catalogue that lives entirely in memory.
#[derive(Default)]
pub struct MemoryCatalogue {
    tables: Mutex<Tables>,
}

impl MemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a descriptor.
    pub fn insert(&self, id: &str, source_location: &str) {
        self.lock().descriptors.insert(
            id.to_string(),
            StreamDescriptor {
                id: id.to_string(),
                source_location: source_location.to_string(),
            },
        );
    }

    /// Current durable status, if one was ever written.
    pub fn status(&self, id: &str) -> Option<StreamRuntimeState> {
        self.lock().statuses.get(id).copied()
    }

    /// Every status written for `id`, oldest first.
    pub fn status_history(&self, id: &str) -> Vec<StreamRuntimeState> {
        self.lock()
            .status_history
            .iter()
            .filter(|(sid, _)| sid == id)
            .map(|(_, state)| *state)
            .collect()
    }

    /// Log entries for `id`, oldest first.
    pub fn logs(&self, id: &str) -> Vec<StreamLogEntry> {
        self.lock()
            .logs
            .iter()
            .filter(|e| e.stream_id == id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalogue for MemoryCatalogue {
    fn read_descriptor(&self, id: &str) -> Result<StreamDescriptor, CatalogueError> {
        self.lock()
            .descriptors
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogueError::NotFound(id.to_string()))
    }

    fn write_status(&self, id: &str, state: StreamRuntimeState) -> Result<(), CatalogueError> {
        let mut tables = self.lock();
        tables.statuses.insert(id.to_string(), state);
        tables.status_history.push((id.to_string(), state));
        Ok(())
    }

    fn append_log(&self, entry: StreamLogEntry) -> Result<(), CatalogueError> {
        self.lock().logs.push(entry);
        Ok(())
    }

    fn record_process(&self, id: &str, pid: Option<u32>) -> Result<(), CatalogueError> {
        let mut tables = self.lock();
        match pid {
            Some(pid) => tables.pids.insert(id.to_string(), pid),
            None => tables.pids.remove(id),
        };
        Ok(())
    }

    fn recorded_process(&self, id: &str) -> Option<u32> {
        self.lock().pids.get(id).copied()
    }

    fn list_ids(&self) -> Result<Vec<StreamId>, CatalogueError> {
        let mut ids: Vec<_> = self.lock().descriptors.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
