use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// The TOML file structure for restream.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub worker: Option<WorkerSection>,
    pub sink: Option<SinkSection>,
    pub output: Option<OutputSection>,
    pub timing: Option<TimingSection>,
    pub catalogue: Option<CatalogueSection>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    pub binary: Option<String>,
    pub mode: Option<WorkerMode>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub output_format: Option<String>,
    pub reconnect_delay_max: Option<u32>,
    pub io_timeout_us: Option<u64>,
    /// If specified, fully replaces the default collision signatures.
    pub collision_patterns: Option<Vec<PatternEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct SinkSection {
    pub base: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OutputSection {
    pub dir: Option<String>,
    pub playback_base: Option<String>,
    pub hls_time: Option<u32>,
    pub hls_list_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TimingSection {
    pub startup_grace_ms: Option<u64>,
    pub collision_backoff_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub restart_pause_ms: Option<u64>,
    pub monitor_window_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogueSection {
    pub streams_file: Option<String>,
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternEntry {
    pub pattern: String,
    pub reason: String,
}

/// How the worker delivers its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Publish to `{sink_base}/{id}`; the distribution server writes `{id}.m3u8`.
    Publish,
    /// Write `stream_{id}.m3u8` and its segments straight into the output dir.
    Hls,
}

/// Fixed argument profile handed to the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub binary: String,
    pub mode: WorkerMode,
    pub video_codec: String,
    pub audio_codec: String,
    pub output_format: String,
    pub reconnect_delay_max: u32,
    pub io_timeout_us: u64,
    pub hls_time: u32,
    pub hls_list_size: u32,
}

/// Every wait and window the supervisor uses.
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub startup_grace: Duration,
    pub collision_backoff: Duration,
    pub stop_grace: Duration,
    pub kill_grace: Duration,
    pub restart_pause: Duration,
    pub monitor_window: Duration,
    pub monitor_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_millis(2000),
            collision_backoff: Duration::from_millis(2000),
            stop_grace: Duration::from_millis(5000),
            kill_grace: Duration::from_millis(5000),
            restart_pause: Duration::from_millis(2000),
            monitor_window: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub worker: WorkerProfile,
    pub sink_base: String,
    pub output_dir: PathBuf,
    pub playback_base: String,
    pub collision_patterns: Vec<(String, String)>,
    pub timings: Timings,
    pub streams_file: PathBuf,
    pub state_dir: PathBuf,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub worker_binary: Option<String>,
    pub worker_mode: Option<WorkerMode>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub output_format: Option<String>,
    pub reconnect_delay_max: Option<u32>,
    pub io_timeout_us: Option<u64>,
    pub collision_patterns: Option<Vec<(String, String)>>,
    pub sink_base: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub playback_base: Option<String>,
    pub hls_time: Option<u32>,
    pub hls_list_size: Option<u32>,
    pub startup_grace_ms: Option<u64>,
    pub collision_backoff_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub restart_pause_ms: Option<u64>,
    pub monitor_window_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
    pub streams_file: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl ConfigFile {
    /// Flatten the sectioned file layout into a mergeable layer.
    pub fn to_partial(self) -> PartialConfig {
        let worker = self.worker;
        let output = self.output;
        let timing = self.timing;
        let catalogue = self.catalogue;

        let mut partial = PartialConfig {
            sink_base: self.sink.and_then(|s| s.base),
            ..Default::default()
        };

        if let Some(w) = worker {
            partial.worker_binary = w.binary;
            partial.worker_mode = w.mode;
            partial.video_codec = w.video_codec;
            partial.audio_codec = w.audio_codec;
            partial.output_format = w.output_format;
            partial.reconnect_delay_max = w.reconnect_delay_max;
            partial.io_timeout_us = w.io_timeout_us;
            partial.collision_patterns = w.collision_patterns.map(|entries| {
                entries
                    .into_iter()
                    .map(|e| (e.pattern, e.reason))
                    .collect()
            });
        }
        if let Some(o) = output {
            partial.output_dir = o.dir.map(PathBuf::from);
            partial.playback_base = o.playback_base;
            partial.hls_time = o.hls_time;
            partial.hls_list_size = o.hls_list_size;
        }
        if let Some(t) = timing {
            partial.startup_grace_ms = t.startup_grace_ms;
            partial.collision_backoff_ms = t.collision_backoff_ms;
            partial.stop_grace_ms = t.stop_grace_ms;
            partial.kill_grace_ms = t.kill_grace_ms;
            partial.restart_pause_ms = t.restart_pause_ms;
            partial.monitor_window_secs = t.monitor_window_secs;
            partial.monitor_interval_secs = t.monitor_interval_secs;
        }
        if let Some(c) = catalogue {
            partial.streams_file = c.streams_file.map(PathBuf::from);
            partial.state_dir = c.state_dir.map(PathBuf::from);
        }
        partial
    }
}
