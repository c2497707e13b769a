//! Stream process supervisor.
//!
//! [`Supervisor`] owns the lifecycle of every stream's worker: it launches
//! workers through the [`WorkerLauncher`], keeps their handles in the
//! [`ProcessRegistry`], runs one background output monitor per active stream
//! and composes status from the registry and the [`OutputWatcher`].
//!
//! **Concurrency model:** `start`, `stop` and `restart` for the same id are
//! serialised by a per-id async operation lock; different ids never contend
//! on it. The registry mutex and the small state maps below are std mutexes
//! that are never held across an await. `status` takes no operation lock, so
//! it observes `Starting` while a launch is in flight.
//!
//! **Cancellation model:** each monitor runs under a child of the root
//! [`CancellationToken`]. Stopping a stream cancels its monitor; `shutdown`
//! cancels the root and stops every registered stream concurrently. A start
//! that registers its worker after the root was cancelled stops it again.
//!
//! **Crash model:** after the output window the monitor keeps checking the
//! worker at the same interval. A worker found exited is taken out of the
//! registry under the operation lock and the stream moves to `Error`.

pub mod artifacts;
pub mod diagnostics;
pub mod handle;
pub mod launcher;
pub mod recovery;
pub mod registry;
pub mod status;
pub mod types;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalogue::{Catalogue, LogLevel, StreamDescriptor, StreamLogEntry};
use crate::config::{AppConfig, Timings};
use crate::error::{ConfigError, SupervisorError};
use crate::outdir::ensure_output_dir;

use artifacts::ArtifactSet;
use diagnostics::DiagnosticClassifier;
use launcher::{FfmpegSpawner, WorkerLauncher, WorkerSpawner};
use recovery::{OrphanReaper, ProcessTableReaper};
use registry::{Occupied, ProcessRegistry};
use status::{StreamHealth, StreamStatus};
use types::{StartOutcome, StreamId, StreamRuntimeState, TerminationOutcome, WorkerExit};
use watcher::{FsOutputWatcher, MonitorOutcome, OutputWatcher};

/// Replaceable collaborators of a [`Supervisor`].
pub struct SupervisorParts {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub reaper: Arc<dyn OrphanReaper>,
    pub watcher: Arc<dyn OutputWatcher>,
    pub classifier: DiagnosticClassifier,
}

struct MonitorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    registry: ProcessRegistry,
    launcher: WorkerLauncher,
    watcher: Arc<dyn OutputWatcher>,
    catalogue: Arc<dyn Catalogue>,
    output_dir: PathBuf,
    playback_base: String,
    timings: Timings,
    states: Mutex<HashMap<StreamId, StreamRuntimeState>>,
    op_locks: Mutex<HashMap<StreamId, Arc<tokio::sync::Mutex<()>>>>,
    monitors: Mutex<HashMap<StreamId, MonitorTask>>,
    /// Exit of the last worker reaped after a crash, until the next transition.
    crashes: Mutex<HashMap<StreamId, WorkerExit>>,
    root_cancel_token: CancellationToken,
}

/// Explicit supervisor context. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build a supervisor for production use: prepares the output directory
    /// and wires the ffmpeg spawner, process-table reaper and filesystem
    /// watcher.
    ///
    /// An unusable output directory is fatal here.
    pub fn init(config: &AppConfig, catalogue: Arc<dyn Catalogue>) -> Result<Self, SupervisorError> {
        let output_dir = ensure_output_dir(&config.output_dir)?;
        let classifier =
            DiagnosticClassifier::new(&config.collision_patterns).map_err(ConfigError::from)?;

        let parts = SupervisorParts {
            spawner: Arc::new(FfmpegSpawner::new(config.worker.clone(), &output_dir)),
            reaper: Arc::new(ProcessTableReaper::new(
                &config.worker.binary,
                &config.sink_base,
                &output_dir,
            )),
            watcher: Arc::new(FsOutputWatcher::new(&output_dir)),
            classifier,
        };

        let config = AppConfig {
            output_dir,
            ..config.clone()
        };
        tracing::info!(
            output_dir = %config.output_dir.display(),
            sink_base = %config.sink_base,
            worker = %config.worker.binary,
            "Supervisor initialised"
        );
        Ok(Self::with_parts(&config, catalogue, parts))
    }

    /// Build a supervisor from explicit collaborators. The output directory
    /// is used as given.
    pub fn with_parts(
        config: &AppConfig,
        catalogue: Arc<dyn Catalogue>,
        parts: SupervisorParts,
    ) -> Self {
        let launcher = WorkerLauncher::new(
            parts.spawner,
            parts.reaper,
            parts.classifier,
            &config.output_dir,
            &config.sink_base,
            config.timings,
        );
        Self {
            inner: Arc::new(Inner {
                registry: ProcessRegistry::new(),
                launcher,
                watcher: parts.watcher,
                catalogue,
                output_dir: config.output_dir.clone(),
                playback_base: config.playback_base.clone(),
                timings: config.timings,
                states: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
                crashes: Mutex::new(HashMap::new()),
                root_cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn output_dir(&self) -> &Path {
        &self.inner.output_dir
    }

    /// In-memory lifecycle state; `Stopped` for streams never touched.
    pub fn state(&self, id: &str) -> StreamRuntimeState {
        lock(&self.inner.states)
            .get(id)
            .copied()
            .unwrap_or(StreamRuntimeState::Stopped)
    }

    /// Start the stream's worker. Succeeds without spawning anything when a
    /// live worker is already registered.
    pub async fn start(&self, id: &str) -> Result<StartOutcome, SupervisorError> {
        let descriptor = self.inner.catalogue.read_descriptor(id)?;
        let op_lock = self.op_lock(id);
        let _guard = op_lock.lock().await;
        self.start_locked(&descriptor).await
    }

    /// Stop the stream's worker and remove its artifacts. Stopping a stream
    /// with no registered worker only records `Stopped`.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let op_lock = self.op_lock(id);
        let _guard = op_lock.lock().await;
        self.stop_locked(id).await;
        Ok(())
    }

    /// Stop (if registered), pause, start. The whole sequence holds the
    /// stream's operation lock, so no other start can slip in between.
    pub async fn restart(&self, id: &str) -> Result<StartOutcome, SupervisorError> {
        let descriptor = self.inner.catalogue.read_descriptor(id)?;
        let op_lock = self.op_lock(id);
        let _guard = op_lock.lock().await;

        if self.inner.registry.contains(id) {
            self.stop_locked(id).await;
            tokio::time::sleep(self.inner.timings.restart_pause).await;
        }
        self.start_locked(&descriptor).await
    }

    /// Current status. Never fails: an unhealthy stream is reported as such.
    pub fn status(&self, id: &str) -> StreamStatus {
        let state = self.state(id);
        let snapshot = self.inner.registry.lookup(id);
        if snapshot.is_none() {
            if let Some(exit) = lock(&self.inner.crashes).get(id) {
                return StreamStatus {
                    stream_id: id.to_string(),
                    state,
                    health: StreamHealth::Failed {
                        exit_code: exit.code,
                        diagnostics: exit.diagnostics.clone(),
                    },
                };
            }
        }
        let watch = snapshot.as_ref().filter(|s| s.is_alive()).map(|s| {
            let artifacts = ArtifactSet::for_stream(id).with_alias(s.alias.as_deref());
            self.inner.watcher.poll_once(&artifacts)
        });
        status::compose(
            id,
            state,
            snapshot.as_ref(),
            watch.as_ref(),
            &self.inner.playback_base,
        )
    }

    /// Ids of streams with a live registered worker, sorted.
    pub fn list_active(&self) -> Vec<StreamId> {
        self.inner
            .registry
            .list()
            .into_iter()
            .filter(|s| s.is_alive())
            .map(|s| s.stream_id)
            .collect()
    }

    /// Cancel every monitor and stop every registered stream concurrently.
    /// Starts that are mid-launch stop their own worker once they register it.
    pub async fn shutdown(&self) {
        self.inner.root_cancel_token.cancel();

        let ids = self.inner.registry.ids();
        tracing::info!(count = ids.len(), "Shutting down supervised streams");
        let results = join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(stream_id = %id, error = %e, "Stop during shutdown failed");
            }
        }

        let tasks: Vec<_> = lock(&self.inner.monitors)
            .drain()
            .map(|(_, m)| m.task)
            .collect();
        join_all(tasks).await;
    }

    async fn start_locked(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<StartOutcome, SupervisorError> {
        let id = descriptor.id.as_str();
        if self.inner.root_cancel_token.is_cancelled() {
            return Err(SupervisorError::ShuttingDown(id.to_string()));
        }

        if let Some(snapshot) = self.inner.registry.lookup(id) {
            if snapshot.is_alive() {
                tracing::debug!(stream_id = %id, pid = ?snapshot.pid, "Already running");
                return Ok(StartOutcome::AlreadyRunning { pid: snapshot.pid });
            }
        }

        // A worker that died since the last start is discarded before relaunch.
        if let Some(mut dead) = self.inner.registry.take_exited(id) {
            self.cancel_monitor(id);
            if let Some(exit) = dead.drain_exit().await {
                tracing::info!(
                    stream_id = %id,
                    code = ?exit.code,
                    "Discarding exited worker before relaunch"
                );
            }
        }

        self.transition(id, StreamRuntimeState::Starting);
        let known_pid = self.inner.catalogue.recorded_process(id);

        let handle = match self.inner.launcher.launch(descriptor, known_pid).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(stream_id = %id, error = %e, "Launch failed");
                self.transition(id, StreamRuntimeState::Error);
                let message = match e.diagnostics() {
                    Some(diag) if !diag.is_empty() => format!("Launch failed: {e}\n{diag}"),
                    _ => format!("Launch failed: {e}"),
                };
                self.log(id, LogLevel::Error, message);
                return Err(SupervisorError::LaunchFailure {
                    id: id.to_string(),
                    source: e,
                });
            }
        };

        let pid = handle.pid();
        let sink = handle.sink().to_string();
        let retried = handle.retry_count() > 0;
        let artifacts = ArtifactSet::for_stream(id).with_alias(handle.alias());

        if let Err(Occupied(rejected)) = self.inner.registry.register(id, handle) {
            // Unreachable while the operation lock is held; keep the new
            // worker and bring the displaced one down rather than leak it.
            tracing::warn!(stream_id = %id, "Registry slot occupied, replacing");
            if let Some(mut displaced) = self.inner.registry.replace(id, rejected) {
                displaced
                    .terminate(self.inner.timings.stop_grace, self.inner.timings.kill_grace)
                    .await;
            }
        }

        // Checked after registering: a shutdown that cancelled before this
        // point may have listed the registry without this worker in it.
        if self.inner.root_cancel_token.is_cancelled() {
            tracing::warn!(stream_id = %id, "Shutdown began during launch, stopping worker");
            self.stop_locked(id).await;
            return Err(SupervisorError::ShuttingDown(id.to_string()));
        }

        if let Err(e) = self.inner.catalogue.record_process(id, pid) {
            tracing::warn!(stream_id = %id, error = %e, "Failed to record worker pid");
        }
        self.transition(id, StreamRuntimeState::Running);
        self.log(
            id,
            LogLevel::Info,
            format!("Stream started (pid {}, sink {sink})", fmt_pid(pid)),
        );
        tracing::info!(stream_id = %id, pid = ?pid, sink = %sink, retried, "Stream running");

        self.spawn_monitor(id, artifacts);
        Ok(StartOutcome::Started { pid, sink, retried })
    }

    async fn stop_locked(&self, id: &str) {
        self.cancel_monitor(id);

        let Some(mut handle) = self.inner.registry.remove(id) else {
            tracing::debug!(stream_id = %id, "Stop requested for unregistered stream");
            self.transition(id, StreamRuntimeState::Stopped);
            return;
        };

        let outcome = handle
            .terminate(self.inner.timings.stop_grace, self.inner.timings.kill_grace)
            .await;
        match outcome {
            TerminationOutcome::Unconfirmed => {
                self.log(
                    id,
                    LogLevel::Warning,
                    format!("Worker {} not confirmed dead after SIGKILL", fmt_pid(handle.pid())),
                );
            }
            TerminationOutcome::Forced => {
                self.log(id, LogLevel::Warning, "Worker ignored SIGTERM and was killed");
            }
            TerminationOutcome::AlreadyExited | TerminationOutcome::Graceful => {}
        }

        let artifacts = ArtifactSet::for_stream(id).with_alias(handle.alias());
        drop(handle);
        match artifacts.purge(&self.inner.output_dir) {
            Ok(removed) => {
                tracing::debug!(stream_id = %id, count = removed.len(), "Purged artifacts on stop");
            }
            Err(e) => {
                tracing::warn!(stream_id = %id, error = %e, "Failed to purge artifacts on stop");
            }
        }

        if let Err(e) = self.inner.catalogue.record_process(id, None) {
            tracing::warn!(stream_id = %id, error = %e, "Failed to clear worker pid");
        }
        self.transition(id, StreamRuntimeState::Stopped);
        self.log(id, LogLevel::Info, "Stream stopped");
        tracing::info!(stream_id = %id, outcome = ?outcome, "Stream stopped");
    }

    fn spawn_monitor(&self, id: &str, artifacts: ArtifactSet) {
        let cancel = self.inner.root_cancel_token.child_token();
        let supervisor = self.clone();
        let stream_id = id.to_string();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            supervisor.watch_worker(&stream_id, &artifacts, &token).await;
        });

        if let Some(previous) = lock(&self.inner.monitors).insert(id.to_string(), MonitorTask { cancel, task }) {
            previous.cancel.cancel();
        }
    }

    /// Body of a stream's monitor task: the output window first, then a
    /// liveness check every monitor interval until the worker is stopped or
    /// found crashed.
    async fn watch_worker(&self, id: &str, artifacts: &ArtifactSet, token: &CancellationToken) {
        let outcome = watcher::monitor(
            self.inner.watcher.as_ref(),
            artifacts,
            self.inner.timings.monitor_window,
            self.inner.timings.monitor_interval,
            token,
            || self.inner.registry.lookup(id).is_some_and(|s| s.is_alive()),
        )
        .await;

        match outcome {
            MonitorOutcome::Live { snapshot, .. } => self.log(
                id,
                LogLevel::Info,
                format!(
                    "Output live ({}, {} segments)",
                    snapshot.playlist.unwrap_or_default(),
                    snapshot.segment_count
                ),
            ),
            MonitorOutcome::TimedOut { .. } => self.log(
                id,
                LogLevel::Warning,
                format!(
                    "No output within {}s of start",
                    self.inner.timings.monitor_window.as_secs()
                ),
            ),
            MonitorOutcome::Cancelled => return,
            MonitorOutcome::WorkerGone => {}
        }

        loop {
            if self.reap_crashed(id, token).await {
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.inner.timings.monitor_interval) => {}
            }
        }
    }

    /// Take an exited worker out of the registry and record the crash.
    /// Returns true once this monitor has nothing left to watch.
    async fn reap_crashed(&self, id: &str, token: &CancellationToken) -> bool {
        let op_lock = self.op_lock(id);
        let _guard = op_lock.lock().await;
        // A stop or restart that ran first owns the stream now.
        if token.is_cancelled() {
            return true;
        }
        if !self.inner.registry.contains(id) {
            return true;
        }
        let Some(mut dead) = self.inner.registry.take_exited(id) else {
            return false;
        };

        let exit = dead.drain_exit().await.unwrap_or(WorkerExit {
            code: None,
            diagnostics: dead.diagnostics(),
        });
        drop(dead);
        lock(&self.inner.monitors).remove(id);

        tracing::error!(
            stream_id = %id,
            code = ?exit.code,
            diagnostics = %exit.diagnostics,
            "Worker exited unexpectedly"
        );
        if let Err(e) = self.inner.catalogue.record_process(id, None) {
            tracing::warn!(stream_id = %id, error = %e, "Failed to clear worker pid");
        }
        self.transition(id, StreamRuntimeState::Error);
        let code = exit.code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        let message = if exit.diagnostics.is_empty() {
            format!("Worker exited unexpectedly ({code})")
        } else {
            format!("Worker exited unexpectedly ({code})\n{}", exit.diagnostics)
        };
        self.log(id, LogLevel::Error, message);
        lock(&self.inner.crashes).insert(id.to_string(), exit);
        true
    }

    fn cancel_monitor(&self, id: &str) {
        if let Some(monitor) = lock(&self.inner.monitors).remove(id) {
            monitor.cancel.cancel();
        }
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.op_locks)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Record a lifecycle transition; durable states go to the catalogue.
    fn transition(&self, id: &str, state: StreamRuntimeState) {
        lock(&self.inner.states).insert(id.to_string(), state);
        if state != StreamRuntimeState::Error {
            lock(&self.inner.crashes).remove(id);
        }
        if state.is_durable() {
            if let Err(e) = self.inner.catalogue.write_status(id, state) {
                tracing::warn!(stream_id = %id, state = state.as_str(), error = %e, "Failed to write status");
            }
        }
    }

    fn log(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        if let Err(e) = self
            .inner
            .catalogue
            .append_log(StreamLogEntry::now(id, level, message))
        {
            tracing::warn!(stream_id = %id, error = %e, "Failed to append stream log");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fmt_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
}
