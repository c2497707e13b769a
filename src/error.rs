use std::path::PathBuf;

use crate::supervisor::types::StreamId;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid collision pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Errors raised by a stream catalogue backend.
#[derive(Debug, thiserror::Error)]
pub enum CatalogueError {
    #[error("Stream {0} not found in catalogue")]
    NotFound(StreamId),

    #[error("Catalogue I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalogue file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to serialize catalogue state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Why a worker could not be brought up. Each variant is permanent for the
/// launch attempt that produced it.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker for stream {id}: {source}")]
    Spawn {
        id: StreamId,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker for stream {id} exited immediately (code {code:?}): {diagnostics}")]
    ExitedEarly {
        id: StreamId,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("Sink {sink} still claimed by another publisher after retry: {diagnostics}")]
    Collision { sink: String, diagnostics: String },

    #[error("Failed to purge stale artifacts for stream {id}: {source}")]
    Purge {
        id: StreamId,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Diagnostic text captured from the worker, when there is any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            LaunchError::ExitedEarly { diagnostics, .. }
            | LaunchError::Collision { diagnostics, .. } => Some(diagnostics),
            LaunchError::Spawn { .. } | LaunchError::Purge { .. } => None,
        }
    }
}

/// Errors surfaced at the supervisor's start/stop/restart/status boundary.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Stream {0} not found")]
    DescriptorNotFound(StreamId),

    #[error("Failed to launch stream {id}: {source}")]
    LaunchFailure {
        id: StreamId,
        #[source]
        source: LaunchError,
    },

    #[error("Output directory {path} is unavailable: {source}")]
    FilesystemUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Catalogue error: {0}")]
    Catalogue(CatalogueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Supervisor is shutting down; stream {0} not started")]
    ShuttingDown(StreamId),
}

impl From<CatalogueError> for SupervisorError {
    fn from(err: CatalogueError) -> Self {
        match err {
            CatalogueError::NotFound(id) => SupervisorError::DescriptorNotFound(id),
            other => SupervisorError::Catalogue(other),
        }
    }
}

/// Errors from the distribution server reachability probe.
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("Distribution server not reachable at {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("Distribution server returned HTTP {status} for {url}")]
    BadStatus { url: String, status: u16 },
}
