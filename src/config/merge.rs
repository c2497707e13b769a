use super::schema::{AppConfig, PartialConfig, Timings, WorkerMode, WorkerProfile};
use crate::supervisor::diagnostics::default_collision_patterns;
use std::path::PathBuf;
use std::time::Duration;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For collision_patterns: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            worker_binary: self.worker_binary.or(fallback.worker_binary),
            worker_mode: self.worker_mode.or(fallback.worker_mode),
            video_codec: self.video_codec.or(fallback.video_codec),
            audio_codec: self.audio_codec.or(fallback.audio_codec),
            output_format: self.output_format.or(fallback.output_format),
            reconnect_delay_max: self.reconnect_delay_max.or(fallback.reconnect_delay_max),
            io_timeout_us: self.io_timeout_us.or(fallback.io_timeout_us),
            collision_patterns: self.collision_patterns.or(fallback.collision_patterns),
            sink_base: self.sink_base.or(fallback.sink_base),
            output_dir: self.output_dir.or(fallback.output_dir),
            playback_base: self.playback_base.or(fallback.playback_base),
            hls_time: self.hls_time.or(fallback.hls_time),
            hls_list_size: self.hls_list_size.or(fallback.hls_list_size),
            startup_grace_ms: self.startup_grace_ms.or(fallback.startup_grace_ms),
            collision_backoff_ms: self.collision_backoff_ms.or(fallback.collision_backoff_ms),
            stop_grace_ms: self.stop_grace_ms.or(fallback.stop_grace_ms),
            kill_grace_ms: self.kill_grace_ms.or(fallback.kill_grace_ms),
            restart_pause_ms: self.restart_pause_ms.or(fallback.restart_pause_ms),
            monitor_window_secs: self.monitor_window_secs.or(fallback.monitor_window_secs),
            monitor_interval_secs: self.monitor_interval_secs.or(fallback.monitor_interval_secs),
            streams_file: self.streams_file.or(fallback.streams_file),
            state_dir: self.state_dir.or(fallback.state_dir),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let defaults = Timings::default();
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);
        let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);

        let timings = Timings {
            startup_grace: ms(self.startup_grace_ms, defaults.startup_grace),
            collision_backoff: ms(self.collision_backoff_ms, defaults.collision_backoff),
            stop_grace: ms(self.stop_grace_ms, defaults.stop_grace),
            kill_grace: ms(self.kill_grace_ms, defaults.kill_grace),
            restart_pause: ms(self.restart_pause_ms, defaults.restart_pause),
            monitor_window: secs(self.monitor_window_secs, defaults.monitor_window),
            // A zero interval would spin the monitor.
            monitor_interval: secs(self.monitor_interval_secs.filter(|s| *s > 0), defaults.monitor_interval),
        };

        AppConfig {
            worker: WorkerProfile {
                binary: self.worker_binary.unwrap_or_else(|| "ffmpeg".to_string()),
                mode: self.worker_mode.unwrap_or(WorkerMode::Publish),
                video_codec: self.video_codec.unwrap_or_else(|| "copy".to_string()),
                audio_codec: self.audio_codec.unwrap_or_else(|| "copy".to_string()),
                output_format: self.output_format.unwrap_or_else(|| "flv".to_string()),
                reconnect_delay_max: self.reconnect_delay_max.unwrap_or(5),
                io_timeout_us: self.io_timeout_us.unwrap_or(10_000_000),
                hls_time: self.hls_time.unwrap_or(3),
                hls_list_size: self.hls_list_size.unwrap_or(60),
            },
            sink_base: self
                .sink_base
                .unwrap_or_else(|| "rtmp://localhost:1935/live".to_string()),
            output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from("/tmp/hls")),
            playback_base: self
                .playback_base
                .unwrap_or_else(|| "http://localhost:8088/hls".to_string()),
            collision_patterns: self
                .collision_patterns
                .unwrap_or_else(default_collision_patterns),
            timings,
            streams_file: self
                .streams_file
                .unwrap_or_else(|| PathBuf::from("./streams.toml")),
            state_dir: self.state_dir.unwrap_or_else(|| PathBuf::from("./.restream")),
        }
    }
}
