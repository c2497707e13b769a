//! Owned worker process.
//!
//! A [`WorkerHandle`] wraps the tokio child of one worker together with its
//! diagnostic output. Stderr is captured into a bounded ring buffer by a
//! reader task; stdin and stdout are not used (the worker writes its media
//! to the sink, never to us).
//!
//! The spawned process:
//! - Runs in its own process group (`process_group(0)`) so termination
//!   reaches anything it forks
//! - Has `kill_on_drop(true)` so a dropped handle never leaves a live worker
//! - Is terminated SIGTERM-first with a bounded grace, escalating to SIGKILL

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::types::{HandleSnapshot, StreamId, TerminationOutcome, WorkerExit};

/// Maximum number of diagnostic lines retained per worker.
const DIAGNOSTIC_CAPACITY: usize = 200;

/// How long to wait for the stderr reader to hit EOF after the worker exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

type DiagnosticBuffer = Arc<Mutex<VecDeque<String>>>;

/// Exclusive owner of one running (or exited, not yet reaped) worker.
pub struct WorkerHandle {
    stream_id: StreamId,
    child: Child,
    pid: Option<u32>,
    sink: String,
    alias: Option<String>,
    spawned_at: DateTime<Utc>,
    retry_count: u32,
    diagnostics: DiagnosticBuffer,
    reader: Option<JoinHandle<()>>,
    exit: Option<WorkerExit>,
}

impl WorkerHandle {
    /// Spawn `command` as the worker for `stream_id`.
    ///
    /// Stdio, process group and kill-on-drop are set here so every spawner
    /// gets the same supervision guarantees.
    pub fn spawn(
        stream_id: &str,
        mut command: Command,
        sink: String,
        alias: Option<String>,
        retry_count: u32,
    ) -> io::Result<Self> {
        let mut child = command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let diagnostics: DiagnosticBuffer =
            Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_CAPACITY)));

        let reader = child.stderr.take().map(|stderr| {
            let buf = diagnostics.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = buf.lock().unwrap_or_else(PoisonError::into_inner);
                    if buf.len() >= DIAGNOSTIC_CAPACITY {
                        buf.pop_front();
                    }
                    buf.push_back(line);
                }
            })
        });

        Ok(Self {
            stream_id: stream_id.to_string(),
            pid: child.id(),
            child,
            sink,
            alias,
            spawned_at: Utc::now(),
            retry_count,
            diagnostics,
            reader,
            exit: None,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Captured diagnostic lines joined with newlines.
    pub fn diagnostics(&self) -> String {
        let buf = self
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        buf.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Non-blocking exit check. Once an exit is observed it is cached.
    pub fn poll_exit(&mut self) -> Option<&WorkerExit> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(stream_id = %self.stream_id, error = %e, "Failed to poll worker");
                }
            }
        }
        self.exit.as_ref()
    }

    /// For an exited worker, wait briefly for its remaining stderr and return
    /// the exit with complete diagnostics. `None` if still running.
    pub async fn drain_exit(&mut self) -> Option<WorkerExit> {
        self.poll_exit()?;
        if let Some(reader) = self.reader.take() {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
        }
        let diagnostics = self.diagnostics();
        let exit = self.exit.as_mut()?;
        exit.diagnostics = diagnostics;
        Some(exit.clone())
    }

    /// Current view of this handle, refreshing the exit state first.
    pub fn snapshot(&mut self) -> HandleSnapshot {
        self.poll_exit();
        HandleSnapshot {
            stream_id: self.stream_id.clone(),
            pid: self.pid,
            sink: self.sink.clone(),
            alias: self.alias.clone(),
            spawned_at: self.spawned_at,
            retry_count: self.retry_count,
            exit: self.exit.clone(),
        }
    }

    /// Bring the worker down: SIGTERM to its process group, wait up to
    /// `grace`, then SIGKILL and wait up to `kill_grace`.
    ///
    /// Never fails; a worker that outlives both waits is reported as
    /// `Unconfirmed` and is killed again when the handle is dropped.
    pub async fn terminate(&mut self, grace: Duration, kill_grace: Duration) -> TerminationOutcome {
        if self.poll_exit().is_some() {
            return TerminationOutcome::AlreadyExited;
        }

        self.signal_group(Signal::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                return TerminationOutcome::Graceful;
            }
            Ok(Err(e)) => {
                tracing::warn!(stream_id = %self.stream_id, error = %e, "Wait after SIGTERM failed");
            }
            Err(_) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Worker ignored SIGTERM, escalating to SIGKILL"
                );
            }
        }

        self.signal_group(Signal::SIGKILL);
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(stream_id = %self.stream_id, error = %e, "start_kill after SIGKILL");
        }
        match tokio::time::timeout(kill_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                TerminationOutcome::Forced
            }
            Ok(Err(e)) => {
                tracing::error!(stream_id = %self.stream_id, error = %e, "Wait after SIGKILL failed");
                TerminationOutcome::Unconfirmed
            }
            Err(_) => {
                tracing::error!(stream_id = %self.stream_id, pid = ?self.pid, "Worker survived SIGKILL");
                TerminationOutcome::Unconfirmed
            }
        }
    }

    /// Signal the worker's whole process group. ESRCH (already gone) is fine.
    fn signal_group(&self, sig: Signal) {
        let Some(pid) = self.pid else {
            return;
        };
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = signal::killpg(pgid, sig) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(stream_id = %self.stream_id, pid, signal = ?sig, error = %e, "killpg failed");
            }
        }
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.exit = Some(WorkerExit {
            code: status.code(),
            diagnostics: self.diagnostics(),
        });
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("stream_id", &self.stream_id)
            .field("pid", &self.pid)
            .field("sink", &self.sink)
            .field("alias", &self.alias)
            .field("retry_count", &self.retry_count)
            .field("exit", &self.exit)
            .finish()
    }
}
