//! Status payload composition.
//!
//! Kept free of I/O: the supervisor gathers the registry snapshot and the
//! watcher observation, [`compose`] turns them into what callers see.

use serde::Serialize;

use super::types::{HandleSnapshot, StreamId, StreamRuntimeState};
use super::watcher::WatchSnapshot;
use crate::distribution::playback_url;

/// Health of a stream's worker and output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamHealth {
    /// No worker registered.
    Inactive,
    /// The registered worker has exited.
    Failed {
        exit_code: Option<i32>,
        diagnostics: String,
    },
    /// Worker alive and a playlist is being served.
    Active {
        pid: Option<u32>,
        playback_url: String,
        segment_count: usize,
        sink: String,
    },
    /// Worker alive but no playlist yet.
    StreamingNoOutput {
        pid: Option<u32>,
        segment_count: usize,
        sink: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub stream_id: StreamId,
    pub state: StreamRuntimeState,
    #[serde(flatten)]
    pub health: StreamHealth,
}

impl StreamStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self.health,
            StreamHealth::Active { .. } | StreamHealth::StreamingNoOutput { .. }
        )
    }
}

/// Merge a registry entry and an output observation into a status payload.
///
/// `watch` is only consulted for a live handle. The playback URL is derived
/// from the playlist the watcher actually found.
pub fn compose(
    stream_id: &str,
    state: StreamRuntimeState,
    handle: Option<&HandleSnapshot>,
    watch: Option<&WatchSnapshot>,
    playback_base: &str,
) -> StreamStatus {
    let health = match handle {
        None => StreamHealth::Inactive,
        Some(HandleSnapshot {
            exit: Some(exit), ..
        }) => StreamHealth::Failed {
            exit_code: exit.code,
            diagnostics: exit.diagnostics.clone(),
        },
        Some(handle) => {
            let segment_count = watch.map_or(0, |w| w.segment_count);
            match watch.and_then(|w| w.playlist.as_deref()) {
                Some(playlist) => StreamHealth::Active {
                    pid: handle.pid,
                    playback_url: playback_url(playback_base, playlist),
                    segment_count,
                    sink: handle.sink.clone(),
                },
                None => StreamHealth::StreamingNoOutput {
                    pid: handle.pid,
                    segment_count,
                    sink: handle.sink.clone(),
                },
            }
        }
    };

    StreamStatus {
        stream_id: stream_id.to_string(),
        state,
        health,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::types::WorkerExit;
    use chrono::Utc;

    const BASE: &str = "http://localhost:8088/hls/";

    fn handle(exit: Option<WorkerExit>) -> HandleSnapshot {
        HandleSnapshot {
            stream_id: "7".into(),
            pid: Some(4321),
            sink: "rtmp://sink/live/7".into(),
            alias: None,
            spawned_at: Utc::now(),
            retry_count: 0,
            exit,
        }
    }

    #[test]
    fn absent_handle_is_inactive() {
        let status = compose("7", StreamRuntimeState::Stopped, None, None, BASE);
        assert_eq!(status.health, StreamHealth::Inactive);
        assert!(!status.is_active());
    }

    #[test]
    fn exited_handle_is_failed_even_with_output() {
        let h = handle(Some(WorkerExit {
            code: Some(1),
            diagnostics: "Connection refused".into(),
        }));
        let watch = WatchSnapshot {
            live: true,
            playlist: Some("7.m3u8".into()),
            segment_count: 4,
        };
        let status = compose("7", StreamRuntimeState::Running, Some(&h), Some(&watch), BASE);
        assert_eq!(
            status.health,
            StreamHealth::Failed {
                exit_code: Some(1),
                diagnostics: "Connection refused".into()
            }
        );
    }

    #[test]
    fn live_handle_without_playlist_has_no_url() {
        let h = handle(None);
        let watch = WatchSnapshot {
            live: false,
            playlist: None,
            segment_count: 2,
        };
        let status = compose("7", StreamRuntimeState::Running, Some(&h), Some(&watch), BASE);
        assert_eq!(
            status.health,
            StreamHealth::StreamingNoOutput {
                pid: Some(4321),
                segment_count: 2,
                sink: "rtmp://sink/live/7".into()
            }
        );
    }

    #[test]
    fn playback_url_follows_the_playlist_found() {
        let h = handle(None);
        let watch = WatchSnapshot {
            live: true,
            playlist: Some("stream_7.m3u8".into()),
            segment_count: 3,
        };
        let status = compose("7", StreamRuntimeState::Running, Some(&h), Some(&watch), BASE);
        match status.health {
            StreamHealth::Active { playback_url, .. } => {
                assert_eq!(playback_url, "http://localhost:8088/hls/stream_7.m3u8");
            }
            other => panic!("expected active, got {other:?}"),
        }
    }

    #[test]
    fn serializes_flat_with_status_tag() {
        let status = compose("7", StreamRuntimeState::Stopped, None, None, BASE);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"stream_id": "7", "state": "stopped", "status": "inactive"})
        );
    }
}
