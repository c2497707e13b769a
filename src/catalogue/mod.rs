//! Stream catalogue seam.
//!
//! The catalogue owns stream descriptors, the durable status of every stream
//! and the per-stream log. The supervisor only reads descriptors and writes
//! status/log entries through the [`Catalogue`] trait; writes are
//! fire-and-forget from its point of view (errors are surfaced to the caller
//! of the trait, never retried).

pub mod file;
pub mod memory;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CatalogueError;
use crate::supervisor::types::{StreamId, StreamRuntimeState};

pub use file::FileCatalogue;
pub use memory::MemoryCatalogue;

/// What the supervisor needs to know to launch a stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: StreamId,
    pub source_location: String,
}

/// Severity of a catalogue log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One line of a stream's operational log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLogEntry {
    pub stream_id: StreamId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: String,
}

impl StreamLogEntry {
    /// Build an entry stamped with the current UTC time.
    pub fn now(stream_id: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// External store of stream descriptors, durable status and logs.
pub trait Catalogue: Send + Sync {
    /// Look up a descriptor. Missing streams are `CatalogueError::NotFound`.
    fn read_descriptor(&self, id: &str) -> Result<StreamDescriptor, CatalogueError>;

    /// Persist a durable state transition.
    fn write_status(&self, id: &str, state: StreamRuntimeState) -> Result<(), CatalogueError>;

    /// Append an entry to the stream's log.
    fn append_log(&self, entry: StreamLogEntry) -> Result<(), CatalogueError>;

    /// Remember (or clear) the PID of the stream's current worker so a later
    /// supervisor instance can terminate it by identity instead of by name.
    fn record_process(&self, id: &str, pid: Option<u32>) -> Result<(), CatalogueError>;

    /// Last PID recorded for the stream, if any.
    fn recorded_process(&self, id: &str) -> Option<u32>;

    /// Every stream the catalogue knows about.
    fn list_ids(&self) -> Result<Vec<StreamId>, CatalogueError>;
}
