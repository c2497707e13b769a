//! Type definitions shared across the supervisor subsystem.
//!
//! These form the vocabulary between the registry, the launcher, the output
//! watcher, the status reporter and the catalogue. Anything handed to callers
//! derives [`serde::Serialize`] so the API layer can return it as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalogue identifier of a stream. Also the sink name and artifact prefix.
pub type StreamId = String;

/// Lifecycle state of a stream as seen by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamRuntimeState {
    Stopped,
    /// Launch in progress; never persisted.
    Starting,
    Running,
    Error,
}

impl StreamRuntimeState {
    /// Whether the catalogue records this state.
    pub fn is_durable(self) -> bool {
        !matches!(self, StreamRuntimeState::Starting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamRuntimeState::Stopped => "stopped",
            StreamRuntimeState::Starting => "starting",
            StreamRuntimeState::Running => "running",
            StreamRuntimeState::Error => "error",
        }
    }
}

/// How a worker process ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub diagnostics: String,
}

/// Read-only view of a registered worker, returned by registry queries.
///
/// This is a snapshot -- the handle may exit right after it is taken.
#[derive(Clone, Debug, Serialize)]
pub struct HandleSnapshot {
    pub stream_id: StreamId,
    pub pid: Option<u32>,
    /// Full sink address the worker publishes to.
    pub sink: String,
    /// Disambiguated sink name when the launch was retried after a collision.
    pub alias: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Set once the process has been observed to exit.
    pub exit: Option<WorkerExit>,
}

impl HandleSnapshot {
    pub fn is_alive(&self) -> bool {
        self.exit.is_none()
    }
}

/// Successful result of `Supervisor::start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started {
        pid: Option<u32>,
        sink: String,
        retried: bool,
    },
    /// A live worker was already registered; nothing was spawned.
    AlreadyRunning { pid: Option<u32> },
}

/// How a worker was brought down by `WorkerHandle::terminate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// The process had already exited before any signal was sent.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Ignored SIGTERM and was reaped after SIGKILL.
    Forced,
    /// Could not be confirmed dead within the kill grace. `kill_on_drop`
    /// still applies when the handle is dropped.
    Unconfirmed,
}
