//! Bringing a worker up.
//!
//! [`WorkerLauncher::launch`] purges stale artifacts, spawns the worker,
//! waits out a short startup grace and inspects whether the process is still
//! alive. A worker that died complaining that its sink is already claimed is
//! retried exactly once against a disambiguated sink, after the previous
//! publisher has been reclaimed through the [`OrphanReaper`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::process::Command;

use super::artifacts::{ArtifactSet, NamingConvention};
use super::diagnostics::DiagnosticClassifier;
use super::handle::WorkerHandle;
use super::recovery::OrphanReaper;
use super::types::{StreamId, WorkerExit};
use crate::catalogue::StreamDescriptor;
use crate::config::{Timings, WorkerMode, WorkerProfile};
use crate::error::LaunchError;

/// Everything needed to spawn one worker attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    pub stream_id: StreamId,
    pub source: String,
    /// Name the worker publishes under: the stream id, or an alias on retry.
    pub sink_name: String,
    /// Full sink address, `{sink_base}/{sink_name}`.
    pub sink: String,
    /// Set when `sink_name` differs from the stream id.
    pub alias: Option<String>,
    pub retry: u32,
    sink_base: String,
}

impl LaunchPlan {
    pub fn new(descriptor: &StreamDescriptor, sink_base: &str) -> Self {
        let sink_base = sink_base.trim_end_matches('/').to_string();
        Self {
            stream_id: descriptor.id.clone(),
            source: descriptor.source_location.clone(),
            sink_name: descriptor.id.clone(),
            sink: format!("{sink_base}/{}", descriptor.id),
            alias: None,
            retry: 0,
            sink_base,
        }
    }

    /// The retry plan: same source, sink renamed to `{id}_{suffix}`.
    pub fn disambiguated(&self, suffix: u64) -> Self {
        let alias = format!("{}_{suffix}", self.stream_id);
        Self {
            stream_id: self.stream_id.clone(),
            source: self.source.clone(),
            sink: format!("{}/{alias}", self.sink_base),
            sink_name: alias.clone(),
            alias: Some(alias),
            retry: self.retry + 1,
            sink_base: self.sink_base.clone(),
        }
    }

    /// Artifacts this attempt can leave behind, alias included.
    pub fn artifacts(&self) -> ArtifactSet {
        ArtifactSet::for_stream(&self.stream_id).with_alias(self.alias.as_deref())
    }
}

/// Builds the OS command for a launch attempt. The launcher owns stdio,
/// process-group and kill-on-drop setup, so implementations only describe
/// the program and its arguments.
pub trait WorkerSpawner: Send + Sync {
    fn command(&self, plan: &LaunchPlan) -> Command;
}

/// [`WorkerSpawner`] for the ffmpeg worker profile.
pub struct FfmpegSpawner {
    profile: WorkerProfile,
    output_dir: PathBuf,
}

impl FfmpegSpawner {
    pub fn new(profile: WorkerProfile, output_dir: &Path) -> Self {
        Self {
            profile,
            output_dir: output_dir.to_path_buf(),
        }
    }

    pub fn build_args(&self, plan: &LaunchPlan) -> Vec<String> {
        let p = &self.profile;
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-reconnect".into(),
            "1".into(),
            "-reconnect_at_eof".into(),
            "1".into(),
            "-reconnect_streamed".into(),
            "1".into(),
            "-reconnect_delay_max".into(),
            p.reconnect_delay_max.to_string(),
            "-timeout".into(),
            p.io_timeout_us.to_string(),
            "-analyzeduration".into(),
            "2147483647".into(),
            "-probesize".into(),
            "2147483647".into(),
            "-i".into(),
            plan.source.clone(),
            "-c:v".into(),
            p.video_codec.clone(),
            "-c:a".into(),
            p.audio_codec.clone(),
        ];

        match p.mode {
            WorkerMode::Publish => {
                args.extend([
                    "-f".into(),
                    p.output_format.clone(),
                    "-err_detect".into(),
                    "ignore_err".into(),
                    plan.sink.clone(),
                ]);
            }
            WorkerMode::Hls => {
                let stem = NamingConvention::WorkerDirect.stem(&plan.sink_name);
                let segments = self.output_dir.join(format!("{stem}_%03d.ts"));
                let playlist = self
                    .output_dir
                    .join(NamingConvention::WorkerDirect.playlist_name(&plan.sink_name));
                args.extend([
                    "-f".into(),
                    "hls".into(),
                    "-hls_time".into(),
                    p.hls_time.to_string(),
                    "-hls_list_size".into(),
                    p.hls_list_size.to_string(),
                    "-hls_flags".into(),
                    "delete_segments".into(),
                    "-hls_segment_filename".into(),
                    segments.display().to_string(),
                    playlist.display().to_string(),
                ]);
            }
        }
        args
    }
}

impl WorkerSpawner for FfmpegSpawner {
    fn command(&self, plan: &LaunchPlan) -> Command {
        let mut cmd = Command::new(&self.profile.binary);
        cmd.args(self.build_args(plan));
        cmd
    }
}

enum Attempt {
    Running(WorkerHandle),
    Exited(WorkerExit),
}

pub struct WorkerLauncher {
    spawner: Arc<dyn WorkerSpawner>,
    reaper: Arc<dyn OrphanReaper>,
    classifier: DiagnosticClassifier,
    output_dir: PathBuf,
    sink_base: String,
    timings: Timings,
}

impl WorkerLauncher {
    pub fn new(
        spawner: Arc<dyn WorkerSpawner>,
        reaper: Arc<dyn OrphanReaper>,
        classifier: DiagnosticClassifier,
        output_dir: &Path,
        sink_base: &str,
        timings: Timings,
    ) -> Self {
        Self {
            spawner,
            reaper,
            classifier,
            output_dir: output_dir.to_path_buf(),
            sink_base: sink_base.to_string(),
            timings,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Bring up a worker for `descriptor`. `known_pid` is the last worker PID
    /// recorded for the stream and is handed to the reaper on collision.
    ///
    /// On success the returned handle was alive at the end of the startup
    /// grace. The caller registers it.
    pub async fn launch(
        &self,
        descriptor: &StreamDescriptor,
        known_pid: Option<u32>,
    ) -> Result<WorkerHandle, LaunchError> {
        let plan = LaunchPlan::new(descriptor, &self.sink_base);
        self.purge(&plan)?;

        let exit = match self.attempt(&plan).await? {
            Attempt::Running(handle) => return Ok(handle),
            Attempt::Exited(exit) => exit,
        };

        let Some(collision) = self.classifier.collision(&exit.diagnostics) else {
            return Err(LaunchError::ExitedEarly {
                id: plan.stream_id,
                code: exit.code,
                diagnostics: exit.diagnostics,
            });
        };

        tracing::warn!(
            stream_id = %plan.stream_id,
            sink = %plan.sink,
            reason = %collision.reason,
            "Sink collision, reclaiming and retrying once"
        );
        let report = self.reaper.reclaim(&plan.stream_id, known_pid).await;
        tracing::info!(
            stream_id = %plan.stream_id,
            method = ?report.method,
            killed = ?report.killed,
            "Reclaim finished"
        );
        tokio::time::sleep(self.timings.collision_backoff).await;

        let retry = plan.disambiguated(sink_suffix());
        self.purge(&retry)?;

        match self.attempt(&retry).await? {
            Attempt::Running(handle) => {
                tracing::info!(stream_id = %retry.stream_id, sink = %retry.sink, "Retry succeeded");
                Ok(handle)
            }
            Attempt::Exited(exit) if self.classifier.collision(&exit.diagnostics).is_some() => {
                Err(LaunchError::Collision {
                    sink: retry.sink,
                    diagnostics: exit.diagnostics,
                })
            }
            Attempt::Exited(exit) => Err(LaunchError::ExitedEarly {
                id: retry.stream_id,
                code: exit.code,
                diagnostics: exit.diagnostics,
            }),
        }
    }

    async fn attempt(&self, plan: &LaunchPlan) -> Result<Attempt, LaunchError> {
        let command = self.spawner.command(plan);
        let mut handle = WorkerHandle::spawn(
            &plan.stream_id,
            command,
            plan.sink.clone(),
            plan.alias.clone(),
            plan.retry,
        )
        .map_err(|source| LaunchError::Spawn {
            id: plan.stream_id.clone(),
            source,
        })?;

        tracing::debug!(
            stream_id = %plan.stream_id,
            pid = ?handle.pid(),
            sink = %plan.sink,
            retry = plan.retry,
            "Worker spawned, waiting out startup grace"
        );
        tokio::time::sleep(self.timings.startup_grace).await;

        Ok(match handle.drain_exit().await {
            Some(exit) => {
                tracing::warn!(
                    stream_id = %plan.stream_id,
                    code = ?exit.code,
                    "Worker exited during startup grace"
                );
                Attempt::Exited(exit)
            }
            None => Attempt::Running(handle),
        })
    }

    fn purge(&self, plan: &LaunchPlan) -> Result<(), LaunchError> {
        let removed = plan
            .artifacts()
            .purge(&self.output_dir)
            .map_err(|source| LaunchError::Purge {
                id: plan.stream_id.clone(),
                source,
            })?;
        if !removed.is_empty() {
            tracing::info!(stream_id = %plan.stream_id, count = removed.len(), "Purged stale artifacts");
        }
        Ok(())
    }
}

/// Time-derived suffix for a disambiguated sink name.
fn sink_suffix() -> u64 {
    Utc::now().timestamp().unsigned_abs() % 1000
}
