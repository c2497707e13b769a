use futures::future::BoxFuture;
use restream::catalogue::{Catalogue, LogLevel, MemoryCatalogue};
use restream::config::{AppConfig, PartialConfig};
use restream::error::{LaunchError, SupervisorError};
use restream::supervisor::diagnostics::DiagnosticClassifier;
use restream::supervisor::launcher::{LaunchPlan, WorkerSpawner};
use restream::supervisor::recovery::{OrphanReaper, ReclaimReport};
use restream::supervisor::status::StreamHealth;
use restream::supervisor::types::{StartOutcome, StreamRuntimeState};
use restream::supervisor::watcher::FsOutputWatcher;
use restream::supervisor::{Supervisor, SupervisorParts};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;

// ─── Helpers ──────────────────────────────────────────────────────────

const HEALTHY: &str = "exec sleep 30";
const UNREACHABLE: &str = "echo \"$2: Connection refused\" >&2; exit 1";
const COLLIDES_ON_PLAIN_SINK: &str =
    "case \"$1\" in */7) echo '[rtmp] Server error: Already publishing' >&2; exit 1;; esac; exec sleep 30";
const IGNORES_SIGTERM: &str = "trap '' TERM; while true; do sleep 1; done";
const DIES_AFTER_A_SECOND: &str = "sleep 1; echo 'Input stream ended' >&2; exit 2";

/// Runs a shell script as the worker with the sink in `$1` and the source
/// in `$2`, counting spawns.
struct ScriptSpawner {
    script: &'static str,
    spawned: AtomicUsize,
}

impl WorkerSpawner for ScriptSpawner {
    fn command(&self, plan: &LaunchPlan) -> Command {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(self.script)
            .arg("worker")
            .arg(&plan.sink)
            .arg(&plan.source);
        cmd
    }
}

#[derive(Default)]
struct CountingReaper {
    calls: AtomicUsize,
}

impl OrphanReaper for CountingReaper {
    fn reclaim<'a>(&'a self, _id: &'a str, _known_pid: Option<u32>) -> BoxFuture<'a, ReclaimReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { ReclaimReport::default() })
    }
}

struct Harness {
    _tmp: TempDir,
    catalogue: Arc<MemoryCatalogue>,
    spawner: Arc<ScriptSpawner>,
    reaper: Arc<CountingReaper>,
    supervisor: Supervisor,
    config: AppConfig,
}

impl Harness {
    fn new(script: &'static str) -> Self {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let config = PartialConfig {
            output_dir: Some(tmp.path().join("hls")),
            sink_base: Some("rtmp://sink:1935/live".into()),
            startup_grace_ms: Some(300),
            collision_backoff_ms: Some(10),
            stop_grace_ms: Some(500),
            kill_grace_ms: Some(1000),
            restart_pause_ms: Some(50),
            monitor_window_secs: Some(30),
            monitor_interval_secs: Some(1),
            ..Default::default()
        }
        .finalize();
        std::fs::create_dir_all(&config.output_dir).unwrap();

        let catalogue = Arc::new(MemoryCatalogue::new());
        catalogue.insert("7", "http://origin/7/index.m3u8");
        catalogue.insert("8", "http://origin/8/index.m3u8");

        let spawner = Arc::new(ScriptSpawner {
            script,
            spawned: AtomicUsize::new(0),
        });
        let reaper = Arc::new(CountingReaper::default());
        let parts = SupervisorParts {
            spawner: spawner.clone(),
            reaper: reaper.clone(),
            watcher: Arc::new(FsOutputWatcher::new(&config.output_dir)),
            classifier: DiagnosticClassifier::default(),
        };
        let supervisor = Supervisor::with_parts(&config, catalogue.clone(), parts);

        Self {
            _tmp: tmp,
            catalogue,
            spawner,
            reaper,
            supervisor,
            config,
        }
    }

    fn dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn touch(&self, name: &str) {
        std::fs::write(self.dir().join(name), b"x").unwrap();
    }

    fn spawned(&self) -> usize {
        self.spawner.spawned.load(Ordering::SeqCst)
    }
}

// ============================================================
// start
// ============================================================

#[tokio::test]
async fn test_concurrent_starts_spawn_one_worker() {
    let h = Harness::new(HEALTHY);

    let (a, b) = tokio::join!(h.supervisor.start("7"), h.supervisor.start("7"));
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(h.spawned(), 1);
    assert_eq!(h.supervisor.registry().len(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, StartOutcome::Started { .. }))
            .count(),
        1
    );
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, StartOutcome::AlreadyRunning { .. })));

    h.supervisor.stop("7").await.unwrap();
}

#[tokio::test]
async fn test_start_is_idempotent_for_live_worker() {
    let h = Harness::new(HEALTHY);

    let first = h.supervisor.start("7").await.unwrap();
    let StartOutcome::Started { pid, sink, retried } = first else {
        panic!("expected Started, got {first:?}");
    };
    assert_eq!(sink, "rtmp://sink:1935/live/7");
    assert!(!retried);

    let second = h.supervisor.start("7").await.unwrap();
    assert_eq!(second, StartOutcome::AlreadyRunning { pid });
    assert_eq!(h.spawned(), 1);
    assert_eq!(h.catalogue.recorded_process("7"), pid);

    h.supervisor.stop("7").await.unwrap();
}

#[tokio::test]
async fn test_state_is_starting_during_launch_then_running() {
    let h = Harness::new(HEALTHY);
    let sup = h.supervisor.clone();
    let task = tokio::spawn(async move { sup.start("7").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Starting);
    assert_eq!(h.supervisor.status("7").state, StreamRuntimeState::Starting);

    task.await.unwrap().unwrap();
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Running);
    // Starting is never persisted.
    assert_eq!(
        h.catalogue.status_history("7"),
        vec![StreamRuntimeState::Running]
    );

    h.supervisor.stop("7").await.unwrap();
}

#[tokio::test]
async fn test_unknown_stream_is_descriptor_not_found() {
    let h = Harness::new(HEALTHY);

    let err = h.supervisor.start("nope").await.unwrap_err();
    assert!(matches!(err, SupervisorError::DescriptorNotFound(id) if id == "nope"));
    let err = h.supervisor.restart("nope").await.unwrap_err();
    assert!(matches!(err, SupervisorError::DescriptorNotFound(_)));
    assert_eq!(h.spawned(), 0);
    assert!(h.catalogue.status_history("nope").is_empty());
}

#[tokio::test]
async fn test_unreachable_source_leaves_error_and_no_handle() {
    let h = Harness::new(UNREACHABLE);

    let err = h.supervisor.start("7").await.unwrap_err();
    match err {
        SupervisorError::LaunchFailure {
            source: LaunchError::ExitedEarly { code, diagnostics, .. },
            ..
        } => {
            assert_eq!(code, Some(1));
            assert!(diagnostics.contains("Connection refused"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(h.supervisor.registry().is_empty());
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Error);
    assert_eq!(h.catalogue.status("7"), Some(StreamRuntimeState::Error));
    assert_eq!(h.reaper.calls.load(Ordering::SeqCst), 0);

    let logs = h.catalogue.logs("7");
    assert!(logs
        .iter()
        .any(|e| e.level == LogLevel::Error && e.message.contains("Connection refused")));

    let status = h.supervisor.status("7");
    assert_eq!(status.health, StreamHealth::Inactive);

    // Error -> Stopped only through an explicit stop.
    h.supervisor.stop("7").await.unwrap();
    assert_eq!(h.catalogue.status("7"), Some(StreamRuntimeState::Stopped));
}

#[tokio::test]
async fn test_collision_retry_registers_second_attempt() {
    let h = Harness::new(COLLIDES_ON_PLAIN_SINK);

    let outcome = h.supervisor.start("7").await.unwrap();
    let StartOutcome::Started { sink, retried, .. } = outcome else {
        panic!("expected Started, got {outcome:?}");
    };
    assert!(retried);
    assert_eq!(h.spawned(), 2);
    assert_eq!(h.reaper.calls.load(Ordering::SeqCst), 1);

    let snapshot = h.supervisor.registry().lookup("7").expect("registered");
    let alias = snapshot.alias.clone().expect("alias recorded");
    assert!(alias.starts_with("7_"));
    assert_eq!(sink, format!("rtmp://sink:1935/live/{alias}"));
    assert_eq!(snapshot.retry_count, 1);
    assert!(snapshot.is_alive());

    // Output under the alias counts as the stream's output and is purged with it.
    h.touch(&format!("{alias}.m3u8"));
    assert!(matches!(
        h.supervisor.status("7").health,
        StreamHealth::Active { .. }
    ));
    h.supervisor.stop("7").await.unwrap();
    assert!(!h.dir().join(format!("{alias}.m3u8")).exists());
}

// ============================================================
// stop
// ============================================================

#[tokio::test]
async fn test_stop_of_unregistered_stream_only_writes_status() {
    let h = Harness::new(HEALTHY);
    h.touch("9.m3u8");

    h.supervisor.stop("9").await.unwrap();
    h.supervisor.stop("9").await.unwrap();

    assert_eq!(
        h.catalogue.status_history("9"),
        vec![StreamRuntimeState::Stopped, StreamRuntimeState::Stopped]
    );
    assert!(h.catalogue.logs("9").is_empty());
    assert!(h.dir().join("9.m3u8").exists());
    assert_eq!(h.spawned(), 0);
}

#[tokio::test]
async fn test_stop_terminates_and_removes_artifacts() {
    let h = Harness::new(HEALTHY);
    h.supervisor.start("7").await.unwrap();
    for name in ["7.m3u8", "7_000.ts", "stream_7.m3u8", "stream_7_000.ts", "77_000.ts"] {
        h.touch(name);
    }

    h.supervisor.stop("7").await.unwrap();

    assert!(h.supervisor.registry().is_empty());
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Stopped);
    assert_eq!(h.catalogue.status("7"), Some(StreamRuntimeState::Stopped));
    assert_eq!(h.catalogue.recorded_process("7"), None);
    assert_eq!(h.supervisor.status("7").health, StreamHealth::Inactive);

    let mut left: Vec<String> = std::fs::read_dir(h.dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    left.sort();
    assert_eq!(left, vec!["77_000.ts"]);
}

#[tokio::test]
async fn test_stop_escalates_to_sigkill_within_bound() {
    let h = Harness::new(IGNORES_SIGTERM);
    h.supervisor.start("7").await.unwrap();

    let started = Instant::now();
    h.supervisor.stop("7").await.unwrap();
    let bound = h.config.timings.stop_grace + h.config.timings.kill_grace + Duration::from_secs(1);

    assert!(started.elapsed() < bound);
    assert!(h.supervisor.registry().is_empty());
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Stopped);
    assert!(h
        .catalogue
        .logs("7")
        .iter()
        .any(|e| e.level == LogLevel::Warning && e.message.contains("SIGTERM")));
}

// ============================================================
// restart
// ============================================================

#[tokio::test]
async fn test_restart_replaces_worker_with_exactly_one_handle() {
    let h = Harness::new(HEALTHY);
    let StartOutcome::Started { pid: first_pid, .. } = h.supervisor.start("7").await.unwrap() else {
        panic!("expected Started");
    };

    let outcome = h.supervisor.restart("7").await.unwrap();
    let StartOutcome::Started { pid: second_pid, .. } = outcome else {
        panic!("expected Started, got {outcome:?}");
    };

    assert_ne!(first_pid, second_pid);
    assert_eq!(h.spawned(), 2);
    assert_eq!(h.supervisor.registry().len(), 1);
    assert_eq!(h.supervisor.registry().lookup("7").unwrap().pid, second_pid);
    assert_eq!(
        h.catalogue.status_history("7"),
        vec![
            StreamRuntimeState::Running,
            StreamRuntimeState::Stopped,
            StreamRuntimeState::Running
        ]
    );

    h.supervisor.stop("7").await.unwrap();
}

#[tokio::test]
async fn test_restart_of_inactive_stream_starts_it() {
    let h = Harness::new(HEALTHY);

    let outcome = h.supervisor.restart("7").await.unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert_eq!(h.spawned(), 1);
    assert_eq!(h.catalogue.status_history("7"), vec![StreamRuntimeState::Running]);

    h.supervisor.stop("7").await.unwrap();
}

// ============================================================
// status
// ============================================================

#[tokio::test]
async fn test_status_moves_from_no_output_to_active() {
    let h = Harness::new(HEALTHY);
    h.supervisor.start("7").await.unwrap();

    let status = h.supervisor.status("7");
    assert_eq!(status.state, StreamRuntimeState::Running);
    assert!(matches!(
        status.health,
        StreamHealth::StreamingNoOutput { segment_count: 0, .. }
    ));

    h.touch("7.m3u8");
    h.touch("7_000.ts");
    match h.supervisor.status("7").health {
        StreamHealth::Active {
            playback_url,
            segment_count,
            pid,
            ..
        } => {
            assert_eq!(playback_url, "http://localhost:8088/hls/7.m3u8");
            assert_eq!(segment_count, 1);
            assert!(pid.is_some());
        }
        other => panic!("expected Active, got {other:?}"),
    }

    h.supervisor.stop("7").await.unwrap();
}

#[tokio::test]
async fn test_exited_worker_reports_failed_and_relaunches() {
    let h = Harness::new(DIES_AFTER_A_SECOND);
    h.supervisor.start("7").await.unwrap();
    assert_eq!(h.supervisor.list_active(), vec!["7"]);

    // Dies about 0.7s after start returns; the monitor checks once a second.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let status = h.supervisor.status("7");
    assert_eq!(status.state, StreamRuntimeState::Error);
    match status.health {
        StreamHealth::Failed { exit_code, diagnostics } => {
            assert_eq!(exit_code, Some(2));
            assert!(diagnostics.contains("Input stream ended"));
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(h.supervisor.list_active().is_empty());
    assert!(h.supervisor.registry().is_empty());
    assert_eq!(h.catalogue.status("7"), Some(StreamRuntimeState::Error));
    assert_eq!(
        h.catalogue.status_history("7"),
        vec![StreamRuntimeState::Running, StreamRuntimeState::Error]
    );
    assert_eq!(h.catalogue.recorded_process("7"), None);
    assert!(h
        .catalogue
        .logs("7")
        .iter()
        .any(|e| e.level == LogLevel::Error && e.message.contains("Input stream ended")));

    let outcome = h.supervisor.start("7").await.unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));
    assert_eq!(h.spawned(), 2);
    assert_eq!(h.supervisor.registry().len(), 1);
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Running);
    assert!(matches!(
        h.supervisor.status("7").health,
        StreamHealth::StreamingNoOutput { .. } | StreamHealth::Active { .. }
    ));

    h.supervisor.stop("7").await.unwrap();
}

// ============================================================
// shutdown
// ============================================================

#[tokio::test]
async fn test_shutdown_stops_every_stream() {
    let h = Harness::new(HEALTHY);
    h.supervisor.start("7").await.unwrap();
    h.supervisor.start("8").await.unwrap();
    assert_eq!(h.supervisor.list_active(), vec!["7", "8"]);

    h.supervisor.shutdown().await;

    assert!(h.supervisor.registry().is_empty());
    assert!(h.supervisor.list_active().is_empty());
    assert_eq!(h.catalogue.status("7"), Some(StreamRuntimeState::Stopped));
    assert_eq!(h.catalogue.status("8"), Some(StreamRuntimeState::Stopped));
}

#[tokio::test]
async fn test_shutdown_during_launch_stops_the_new_worker() {
    let h = Harness::new(HEALTHY);
    let sup = h.supervisor.clone();
    let task = tokio::spawn(async move { sup.start("7").await });

    // Still inside the startup grace, before the worker is registered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.supervisor.registry().is_empty());
    h.supervisor.shutdown().await;

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, SupervisorError::ShuttingDown(id) if id == "7"));
    assert!(h.supervisor.registry().is_empty());
    assert_eq!(h.supervisor.state("7"), StreamRuntimeState::Stopped);
    assert_eq!(h.catalogue.status("7"), Some(StreamRuntimeState::Stopped));

    let err = h.supervisor.start("8").await.unwrap_err();
    assert!(matches!(err, SupervisorError::ShuttingDown(_)));
    assert_eq!(h.spawned(), 1);
}
