//! Fallback recovery for workers the supervisor no longer holds a handle to.
//!
//! Used when a sink turns out to be claimed by a publisher we did not spawn
//! in this process lifetime (e.g. left behind by a previous supervisor
//! instance). The recorded PID from the catalogue is preferred; only when
//! there is none, or it no longer looks like our worker, do we fall back to
//! matching command lines in the OS process table.
//!
//! The command-line match is a heuristic. It is scoped to the worker binary
//! and the exact sink / playlist path of the stream, but an unrelated process
//! with an identical command line would still be killed.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

/// Reclaims a stream's sink from orphaned workers.
pub trait OrphanReaper: Send + Sync {
    /// Kill whatever is holding `id`'s sink. Best-effort: never fails.
    fn reclaim<'a>(&'a self, id: &'a str, known_pid: Option<u32>) -> BoxFuture<'a, ReclaimReport>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimMethod {
    RecordedPid,
    CommandLineMatch,
}

/// What a reclaim pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub method: Option<ReclaimMethod>,
    pub killed: Vec<u32>,
}

/// One row of `ps -eo pid=,args=`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub args: String,
}

/// Parse `ps -eo pid=,args=` output. Malformed rows are skipped.
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                args: args.trim().to_string(),
            })
        })
        .collect()
}

/// [`OrphanReaper`] backed by the OS process table.
pub struct ProcessTableReaper {
    binary_name: String,
    sink_base: String,
    output_dir: PathBuf,
}

impl ProcessTableReaper {
    pub fn new(binary: &str, sink_base: &str, output_dir: &Path) -> Self {
        let binary_name = Path::new(binary)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(binary)
            .to_string();
        Self {
            binary_name,
            sink_base: sink_base.trim_end_matches('/').to_string(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Whether `entry` looks like a worker for stream `id`: the executable is
    /// the worker binary and an argument is the stream's sink (or a
    /// disambiguated `{id}_N` sink) or its direct-output playlist.
    pub fn is_worker_for(&self, id: &str, entry: &ProcessEntry) -> bool {
        let exe_matches = entry
            .args
            .split_whitespace()
            .next()
            .and_then(|exe| Path::new(exe).file_name())
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == self.binary_name);
        exe_matches
            && self
                .target_regex(id)
                .is_ok_and(|re| re.is_match(&entry.args))
    }

    /// PIDs in `table` that look like workers for `id`, excluding ourselves.
    pub fn candidates(&self, id: &str, table: &[ProcessEntry]) -> Vec<u32> {
        let own = std::process::id();
        table
            .iter()
            .filter(|e| e.pid != own && self.is_worker_for(id, e))
            .map(|e| e.pid)
            .collect()
    }

    fn target_regex(&self, id: &str) -> Result<Regex, regex::Error> {
        let sink = regex::escape(&format!("{}/{id}", self.sink_base));
        let playlist = regex::escape(
            &self
                .output_dir
                .join(format!("stream_{id}"))
                .display()
                .to_string(),
        );
        Regex::new(&format!(
            r"(?:^|\s)(?:{sink}(?:_\d+)?|{playlist}(?:_\d+)?\.m3u8)(?:\s|$)"
        ))
    }

    async fn process_table() -> std::io::Result<Vec<ProcessEntry>> {
        let output = Command::new("ps").args(["-eo", "pid=,args="]).output().await?;
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn kill(id: &str, pid: u32) -> bool {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!(stream_id = %id, pid, "Killed orphaned worker");
                true
            }
            Err(e) => {
                tracing::warn!(stream_id = %id, pid, error = %e, "Failed to kill orphaned worker");
                false
            }
        }
    }
}

impl OrphanReaper for ProcessTableReaper {
    fn reclaim<'a>(&'a self, id: &'a str, known_pid: Option<u32>) -> BoxFuture<'a, ReclaimReport> {
        Box::pin(async move {
            let table = match Self::process_table().await {
                Ok(table) => table,
                Err(e) => {
                    tracing::warn!(stream_id = %id, error = %e, "Could not read process table");
                    return ReclaimReport::default();
                }
            };

            if let Some(pid) = known_pid {
                let still_ours = table
                    .iter()
                    .any(|e| e.pid == pid && self.is_worker_for(id, e));
                if still_ours {
                    let killed = if Self::kill(id, pid) { vec![pid] } else { Vec::new() };
                    return ReclaimReport {
                        method: Some(ReclaimMethod::RecordedPid),
                        killed,
                    };
                }
                tracing::debug!(stream_id = %id, pid, "Recorded PID is gone or reused");
            }

            let killed = self
                .candidates(id, &table)
                .into_iter()
                .filter(|pid| Self::kill(id, *pid))
                .collect();
            ReclaimReport {
                method: Some(ReclaimMethod::CommandLineMatch),
                killed,
            }
        })
    }
}
