//! Filesystem liveness oracle.
//!
//! The worker gives no push signal of progress, so liveness is inferred from
//! the artifacts that appear in the shared output directory. The polling is
//! isolated behind [`OutputWatcher`] so another source of progress can
//! replace it without touching the supervisor.
//!
//! Watchers never mutate anything.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::artifacts::ArtifactSet;

/// One observation of a stream's output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WatchSnapshot {
    /// A playlist exists under one of the known conventions.
    pub live: bool,
    /// File name of the playlist that was found, in preference order.
    pub playlist: Option<String>,
    pub segment_count: usize,
}

/// Answers "is this stream producing output?".
pub trait OutputWatcher: Send + Sync {
    fn poll_once(&self, artifacts: &ArtifactSet) -> WatchSnapshot;
}

/// [`OutputWatcher`] that inspects the output directory.
pub struct FsOutputWatcher {
    dir: PathBuf,
}

impl FsOutputWatcher {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl OutputWatcher for FsOutputWatcher {
    fn poll_once(&self, artifacts: &ArtifactSet) -> WatchSnapshot {
        let playlist = artifacts
            .playlist_candidates()
            .into_iter()
            .find(|name| self.dir.join(name).is_file());

        let segment_count = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.file_name().to_str().is_some_and(|n| artifacts.is_segment(n)))
                .count(),
            Err(e) => {
                tracing::debug!(dir = %self.dir.display(), error = %e, "Cannot list output dir");
                0
            }
        };

        WatchSnapshot {
            live: playlist.is_some(),
            playlist,
            segment_count,
        }
    }
}

/// Why a monitoring window ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Output observed.
    Live { polls: u32, snapshot: WatchSnapshot },
    /// The worker exited or left the registry.
    WorkerGone,
    /// The monitor's token was cancelled.
    Cancelled,
    /// The window elapsed with no output. Informational only.
    TimedOut { polls: u32 },
}

/// Poll `watcher` every `interval` until output appears, `is_running`
/// reports the worker gone, `cancel` fires, or `window` elapses.
///
/// A timeout is logged as a warning and nothing else: the worker may still
/// be buffering, so it is never a reason to stop the stream.
pub async fn monitor<F>(
    watcher: &dyn OutputWatcher,
    artifacts: &ArtifactSet,
    window: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    is_running: F,
) -> MonitorOutcome
where
    F: Fn() -> bool,
{
    let stream_id = artifacts.names().first().cloned().unwrap_or_default();
    let deadline = Instant::now() + window;
    let mut polls = 0u32;

    loop {
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                stream_id = %stream_id,
                polls,
                window_secs = window.as_secs(),
                "No output observed within monitoring window"
            );
            return MonitorOutcome::TimedOut { polls };
        }

        let wait = interval.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return MonitorOutcome::Cancelled,
            _ = tokio::time::sleep(wait) => {}
        }

        if !is_running() {
            tracing::debug!(stream_id = %stream_id, "Worker gone, monitor exiting");
            return MonitorOutcome::WorkerGone;
        }

        polls += 1;
        let snapshot = watcher.poll_once(artifacts);
        if snapshot.live {
            tracing::info!(
                stream_id = %stream_id,
                polls,
                playlist = ?snapshot.playlist,
                segments = snapshot.segment_count,
                "Output confirmed"
            );
            return MonitorOutcome::Live { polls, snapshot };
        }
        tracing::debug!(stream_id = %stream_id, polls, "No playlist yet");
    }
}
