//! Unit tests for the lifecycle engine, driven through a fake process control.

use super::*;
use crate::config::TimeoutConfig;
use crate::lifecycle::RestartPolicy;
use async_trait::async_trait;
use chrono::Utc;
use procmaster_common::{ProcessSpec, SupervisorError, SupervisorResult};
use procmaster_process_control::{next_launch_id, ExitReport, LaunchInfo, ProcessControl};
use procmaster_process_state::ProcessStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::time::Duration;

static FAKE_PID: AtomicU32 = AtomicU32::new(10_000);

#[derive(Default)]
struct FakeState {
    running: bool,
    pid: Option<u32>,
    launch_id: Option<u64>,
    start_attempts: u32,
    stops: u32,
    fail_starts: bool,
    start_delay: Option<Duration>,
    last_exit: Option<ExitReport>,
}

struct FakeControl {
    name: String,
    state: Arc<Mutex<FakeState>>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
}

impl FakeControl {
    fn detached(name: &str) -> Self {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(FakeState::default())),
            exit_tx,
        }
    }
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn start(&mut self) -> SupervisorResult<LaunchInfo> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.start_attempts += 1;
            if state.running {
                return Err(SupervisorError::already_running(&self.name, state.pid));
            }
            if state.fail_starts {
                return Err(SupervisorError::launch_failed(
                    &self.name,
                    "No such file or directory (os error 2)",
                ));
            }
            state.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let launch = LaunchInfo {
            pid: FAKE_PID.fetch_add(1, Ordering::Relaxed),
            launch_id: next_launch_id(),
            started_at: Utc::now(),
        };
        state.running = true;
        state.pid = Some(launch.pid);
        state.launch_id = Some(launch.launch_id);
        Ok(launch)
    }

    async fn stop(&mut self) -> SupervisorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        if state.running {
            // The real watcher reports every exit, stops included.
            let report = ExitReport {
                code: None,
                signal: Some(15),
                at: Utc::now(),
            };
            send_exit(&self.name, &mut state, &self.exit_tx, report);
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.running.then_some(state.pid).flatten()
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn last_exit(&self) -> Option<ExitReport> {
        self.state.lock().unwrap().last_exit.clone()
    }
}

fn send_exit(
    name: &str,
    state: &mut FakeState,
    exit_tx: &mpsc::UnboundedSender<ExitEvent>,
    report: ExitReport,
) {
    state.running = false;
    state.last_exit = Some(report.clone());
    let _ = exit_tx.send(ExitEvent {
        name: name.to_string(),
        launch_id: state.launch_id.unwrap_or_default(),
        pid: state.pid.unwrap_or_default(),
        report,
    });
}

#[derive(Default)]
struct FakeFactory {
    controls: Mutex<HashMap<String, (Arc<Mutex<FakeState>>, mpsc::UnboundedSender<ExitEvent>)>>,
    fail_new: Mutex<bool>,
}

impl FakeFactory {
    fn state(&self, name: &str) -> Arc<Mutex<FakeState>> {
        self.controls.lock().unwrap()[name].0.clone()
    }

    /// Make the live process of `name` exit as if it crashed.
    fn crash(&self, name: &str) {
        let (state, exit_tx) = self.controls.lock().unwrap()[name].clone();
        let mut state = state.lock().unwrap();
        assert!(state.running, "{} is not running", name);
        let report = ExitReport {
            code: Some(1),
            signal: None,
            at: Utc::now(),
        };
        send_exit(name, &mut state, &exit_tx, report);
    }

    /// Deliver an exit event for a launch that is not the current one.
    fn send_stale_exit(&self, name: &str) {
        let (_, exit_tx) = self.controls.lock().unwrap()[name].clone();
        let _ = exit_tx.send(ExitEvent {
            name: name.to_string(),
            launch_id: 0,
            pid: 1,
            report: ExitReport {
                code: Some(0),
                signal: None,
                at: Utc::now(),
            },
        });
    }

    fn set_fail_starts(&self, name: &str, fail: bool) {
        self.state(name).lock().unwrap().fail_starts = fail;
    }

    fn start_attempts(&self, name: &str) -> u32 {
        self.state(name).lock().unwrap().start_attempts
    }

    fn stops(&self, name: &str) -> u32 {
        self.state(name).lock().unwrap().stops
    }
}

impl ControlFactory for FakeFactory {
    fn create(
        &self,
        spec: &ProcessSpec,
        exit_tx: mpsc::UnboundedSender<ExitEvent>,
    ) -> Box<dyn ProcessControl> {
        let state = Arc::new(Mutex::new(FakeState {
            fail_starts: *self.fail_new.lock().unwrap(),
            ..FakeState::default()
        }));
        self.controls
            .lock()
            .unwrap()
            .insert(spec.name.clone(), (state.clone(), exit_tx.clone()));
        Box::new(FakeControl {
            name: spec.name.clone(),
            state,
            exit_tx,
        })
    }
}

fn test_policy() -> RestartPolicy {
    RestartPolicy {
        min_interval: Duration::from_millis(20),
        backoff_rate: 2.0,
        max_interval: Duration::from_millis(200),
        reset_after: Duration::from_secs(60),
        max_consecutive_failures: 3,
        check_interval: Duration::from_millis(10),
    }
}

fn test_config(policy: RestartPolicy) -> EngineConfig {
    EngineConfig {
        policy,
        timeouts: TimeoutConfig {
            launch: Duration::from_secs(1),
            graceful_stop: Duration::from_secs(1),
            force_kill: Duration::from_secs(1),
        },
    }
}

fn create_engine_with(policy: RestartPolicy) -> (LifecycleEngine, Arc<FakeFactory>) {
    let factory = Arc::new(FakeFactory::default());
    let engine = LifecycleEngine::with_factory(test_config(policy), factory.clone());
    (engine, factory)
}

fn create_engine() -> (LifecycleEngine, Arc<FakeFactory>) {
    create_engine_with(test_policy())
}

fn spec(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, format!("/opt/bin/{}", name))
}

/// Poll `engine.process_info(name)` until `predicate` holds or `timeout`
/// expires.
async fn wait_for_info(
    engine: &LifecycleEngine,
    name: &str,
    predicate: impl Fn(&ProcessInfo) -> bool,
    timeout: Duration,
) -> ProcessInfo {
    let poll_interval = Duration::from_millis(2);
    let result = tokio::time::timeout(timeout, async {
        loop {
            if let Ok(info) = engine.process_info(name).await {
                if predicate(&info) {
                    return info;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
    .await;

    match result {
        Ok(info) => info,
        Err(_) => panic!(
            "wait_for_info timed out after {:?}. Final info: {:?}",
            timeout,
            engine.process_info(name).await
        ),
    }
}

// ============================================================================
// Launch and queries
// ============================================================================

#[tokio::test]
async fn test_launch_reports_running_with_pid() {
    let (engine, _factory) = create_engine();

    engine
        .start_go_bin(spec("api").with_keep_alive(true).with_args(["--port", "8080"]))
        .await
        .unwrap();

    let status = engine.monit_status().await.unwrap();
    let entry = status.get("api").expect("api should be listed");
    assert_eq!(entry.status, ProcessStatus::Running);
    assert!(entry.pid.is_some());
    assert!(entry.keep_alive);

    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.source_path, "/opt/bin/api");
    assert_eq!(info.args, vec!["--port", "8080"]);
    assert_eq!(info.restart_count, 0);
    assert!(info.started_at.is_some());
}

#[tokio::test]
async fn test_duplicate_name_leaves_existing_record_untouched() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();
    let before = engine.process_info("api").await.unwrap();

    let err = engine
        .start_go_bin(ProcessSpec::new("api", "/other/path"))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::DuplicateName { ref name } if name == "api"));

    let after = engine.process_info("api").await.unwrap();
    assert_eq!(after.pid, before.pid);
    assert_eq!(after.status, ProcessStatus::Running);
    assert_eq!(after.source_path, "/opt/bin/api");
    assert_eq!(factory.start_attempts("api"), 1);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let (engine, _factory) = create_engine();

    let err = engine
        .start_go_bin(ProcessSpec::new("api", ""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_request");
    assert!(engine.monit_status().await.unwrap().procs.is_empty());
}

#[tokio::test]
async fn test_unknown_name_is_not_found() {
    let (engine, _factory) = create_engine();

    for result in [
        engine.start_process("ghost").await,
        engine.restart_process("ghost").await,
        engine.stop_process("ghost").await,
        engine.delete_process("ghost").await,
    ] {
        match result {
            Err(SupervisorError::NotFound { name }) => assert_eq!(name, "ghost"),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }
    assert_eq!(engine.process_info("ghost").await.unwrap_err().kind(), "not_found");
    assert!(engine.monit_status().await.unwrap().procs.is_empty());
}

#[tokio::test]
async fn test_monit_status_is_sorted_and_specs_match() {
    let (engine, _factory) = create_engine();
    for name in ["worker", "api", "cron"] {
        engine.start_go_bin(spec(name)).await.unwrap();
    }

    let names: Vec<String> = engine
        .monit_status()
        .await
        .unwrap()
        .procs
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["api", "cron", "worker"]);

    let specs = engine.specs().await.unwrap();
    assert_eq!(specs.len(), 3);
    assert_eq!(specs[0], spec("api"));
}

// ============================================================================
// User operations
// ============================================================================

#[tokio::test]
async fn test_start_running_process_is_already_running() {
    let (engine, _factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();

    let err = engine.start_process("api").await.unwrap_err();
    assert_eq!(err.kind(), "already_running");
}

#[tokio::test]
async fn test_stop_then_start_counts_a_restart() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();

    engine.stop_process("api").await.unwrap();
    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Stopped);
    assert_eq!(info.pid, None);
    assert_eq!(factory.stops("api"), 1);

    // Stopping again is a no-op.
    engine.stop_process("api").await.unwrap();
    assert_eq!(
        engine.process_info("api").await.unwrap().status,
        ProcessStatus::Stopped
    );

    engine.start_process("api").await.unwrap();
    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Running);
    assert_eq!(info.restart_count, 1);
}

#[tokio::test]
async fn test_restart_replaces_live_process() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();
    let old_pid = engine.process_info("api").await.unwrap().pid;

    engine.restart_process("api").await.unwrap();

    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Running);
    assert_eq!(info.restart_count, 1);
    assert_ne!(info.pid, old_pid);
    assert_eq!(factory.stops("api"), 1);
}

#[tokio::test]
async fn test_restart_of_stopped_process_launches_it() {
    let (engine, _factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();
    engine.stop_process("api").await.unwrap();

    engine.restart_process("api").await.unwrap();
    assert_eq!(
        engine.process_info("api").await.unwrap().status,
        ProcessStatus::Running
    );
}

#[tokio::test]
async fn test_delete_removes_record_and_frees_name() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();
    let old_pid = engine.process_info("api").await.unwrap().pid;

    engine.delete_process("api").await.unwrap();
    assert_eq!(engine.process_info("api").await.unwrap_err().kind(), "not_found");
    assert!(engine.monit_status().await.unwrap().procs.is_empty());
    assert_eq!(factory.stops("api"), 1);

    engine.start_go_bin(spec("api")).await.unwrap();
    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Running);
    assert_ne!(info.pid, old_pid);
    assert_eq!(info.restart_count, 0);
}

#[tokio::test]
async fn test_failed_launch_leaves_crashed_record() {
    let (engine, factory) = create_engine();
    *factory.fail_new.lock().unwrap() = true;

    let err = engine.start_go_bin(spec("api")).await.unwrap_err();
    assert!(matches!(err, SupervisorError::LaunchFailed { .. }));

    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Crashed);
    assert_eq!(info.pid, None);
    assert!(info.last_error.is_some());

    // The record keeps its name until deleted.
    let err = engine.start_go_bin(spec("api")).await.unwrap_err();
    assert_eq!(err.kind(), "duplicate_name");

    factory.set_fail_starts("api", false);
    engine.start_process("api").await.unwrap();
    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Running);
    assert_eq!(info.last_error, None);
}

#[tokio::test]
async fn test_deadline_bounds_launch() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();
    engine.stop_process("api").await.unwrap();
    factory.state("api").lock().unwrap().start_delay = Some(Duration::from_millis(500));

    let err = engine
        .with_deadline(Duration::from_millis(50))
        .start_process("api")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::LaunchFailed { .. }));
    assert!(err.to_string().contains("not confirmed"));
    wait_for_info(
        &engine,
        "api",
        |i| i.status == ProcessStatus::Crashed,
        Duration::from_secs(1),
    )
    .await;
}

#[tokio::test]
async fn test_caller_deadline_covers_time_spent_queued() {
    let (engine, _factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();

    let holder = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.hold("api", Duration::from_millis(600)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let bounded = engine.with_deadline(Duration::from_millis(100));
    let err = tokio::time::timeout(Duration::from_millis(400), bounded.stop_process("api"))
        .await
        .expect("the caller deadline should end the wait")
        .unwrap_err();
    assert_eq!(err.kind(), "termination_failed");

    // The queued stop still runs once the record is free.
    holder.await.unwrap().unwrap();
    wait_for_info(
        &engine,
        "api",
        |i| i.status == ProcessStatus::Stopped,
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test]
async fn test_concurrent_ops_on_one_record_are_queued() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();

    let sleeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .hold("api", Duration::from_millis(100))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let restarts: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.restart_process("api").await })
        })
        .collect();

    // Queries are not blocked by the busy record.
    let status = tokio::time::timeout(Duration::from_millis(50), engine.monit_status())
        .await
        .expect("monit_status should not wait for the busy record")
        .unwrap();
    assert_eq!(status.procs.len(), 1);

    sleeper.await.unwrap().unwrap();
    for restart in restarts {
        restart.await.unwrap().unwrap();
    }

    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Running);
    assert_eq!(info.restart_count, 3);
    assert_eq!(factory.stops("api"), 3);
}

#[tokio::test]
async fn test_different_records_do_not_block_each_other() {
    let (engine, _factory) = create_engine();
    engine.start_go_bin(spec("slow")).await.unwrap();
    engine.start_go_bin(spec("fast")).await.unwrap();

    let sleeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .hold("slow", Duration::from_millis(300))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_millis(150), engine.restart_process("fast"))
        .await
        .expect("restart of another record should not wait")
        .unwrap();
    sleeper.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_busy_records_do_not_hold_up_another_name() {
    let (engine, _factory) = create_engine();
    for i in 0..12 {
        engine.start_go_bin(spec(&format!("p{}", i))).await.unwrap();
    }

    let holders: Vec<_> = (0..11)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .hold(&format!("p{}", i), Duration::from_millis(800))
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_millis(300), engine.stop_process("p11"))
        .await
        .expect("stop of an idle record should not wait for busy ones")
        .unwrap();
    assert_eq!(
        engine.process_info("p11").await.unwrap().status,
        ProcessStatus::Stopped
    );

    for holder in holders {
        holder.await.unwrap().unwrap();
    }
}

// ============================================================================
// Exit handling and keep-alive
// ============================================================================

#[tokio::test]
async fn test_exit_without_keep_alive_is_crashed() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("batch")).await.unwrap();

    factory.crash("batch");

    let info = wait_for_info(
        &engine,
        "batch",
        |i| i.status == ProcessStatus::Crashed,
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(info.pid, None);
    assert_eq!(info.last_exit.map(|e| e.code), Some(Some(1)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(factory.start_attempts("batch"), 1);
}

#[tokio::test]
async fn test_keep_alive_restarts_after_crash() {
    let (engine, factory) = create_engine();
    engine
        .start_go_bin(spec("worker").with_keep_alive(true))
        .await
        .unwrap();
    let old_pid = engine.process_info("worker").await.unwrap().pid;

    factory.crash("worker");

    let info = wait_for_info(
        &engine,
        "worker",
        |i| i.status == ProcessStatus::Running && i.restart_count == 1,
        Duration::from_secs(2),
    )
    .await;
    assert_ne!(info.pid, old_pid);
    assert!(info.last_exit.is_some());
}

#[tokio::test]
async fn test_stale_exit_is_ignored() {
    let (engine, factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();

    factory.send_stale_exit("api");

    // Exit events are handled before later commands.
    let info = engine.process_info("api").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Running);
    assert!(info.last_exit.is_none());
}

#[tokio::test]
async fn test_stop_wins_over_scheduled_restart() {
    let policy = RestartPolicy {
        min_interval: Duration::from_millis(300),
        ..test_policy()
    };
    let (engine, factory) = create_engine_with(policy);
    engine
        .start_go_bin(spec("worker").with_keep_alive(true))
        .await
        .unwrap();

    factory.crash("worker");
    wait_for_info(
        &engine,
        "worker",
        |i| i.status == ProcessStatus::Pending,
        Duration::from_secs(1),
    )
    .await;

    engine.stop_process("worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let info = engine.process_info("worker").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Stopped);
    assert_eq!(info.restart_count, 0);
    assert_eq!(factory.start_attempts("worker"), 1);
}

#[tokio::test]
async fn test_stop_wins_over_exit_seen_while_busy() {
    let (engine, factory) = create_engine();
    engine
        .start_go_bin(spec("worker").with_keep_alive(true))
        .await
        .unwrap();

    let sleeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .hold("worker", Duration::from_millis(100))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The exit arrives while the record is busy and the stop queues behind it.
    factory.crash("worker");
    engine.stop_process("worker").await.unwrap();
    sleeper.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let info = engine.process_info("worker").await.unwrap();
    assert_eq!(info.status, ProcessStatus::Stopped);
    assert_eq!(factory.start_attempts("worker"), 1);
}

#[tokio::test]
async fn test_delete_wins_over_scheduled_restart() {
    let policy = RestartPolicy {
        min_interval: Duration::from_millis(300),
        ..test_policy()
    };
    let (engine, factory) = create_engine_with(policy);
    engine
        .start_go_bin(spec("worker").with_keep_alive(true))
        .await
        .unwrap();

    factory.crash("worker");
    engine.delete_process("worker").await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(engine.process_info("worker").await.unwrap_err().kind(), "not_found");
    assert_eq!(factory.start_attempts("worker"), 1);
}

#[tokio::test]
async fn test_gives_up_after_max_consecutive_failures() {
    let (engine, factory) = create_engine();
    engine
        .start_go_bin(spec("flaky").with_keep_alive(true))
        .await
        .unwrap();

    for expected in 1..=2 {
        factory.crash("flaky");
        wait_for_info(
            &engine,
            "flaky",
            |i| i.status == ProcessStatus::Running && i.restart_count == expected,
            Duration::from_secs(2),
        )
        .await;
    }

    factory.crash("flaky");
    let info = wait_for_info(
        &engine,
        "flaky",
        |i| i.status == ProcessStatus::Crashed,
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(info.restart_count, 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(factory.start_attempts("flaky"), 3);

    // A user start begins a fresh sequence.
    engine.start_process("flaky").await.unwrap();
    factory.crash("flaky");
    wait_for_info(
        &engine,
        "flaky",
        |i| i.status == ProcessStatus::Running && i.restart_count == 4,
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test]
async fn test_failed_automatic_restart_is_retried() {
    let policy = RestartPolicy {
        max_consecutive_failures: 10,
        ..test_policy()
    };
    let (engine, factory) = create_engine_with(policy);
    engine
        .start_go_bin(spec("worker").with_keep_alive(true))
        .await
        .unwrap();

    factory.set_fail_starts("worker", true);
    factory.crash("worker");

    tokio::time::timeout(Duration::from_secs(2), async {
        while factory.start_attempts("worker") < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("automatic restart should be retried");

    factory.set_fail_starts("worker", false);
    let info = wait_for_info(
        &engine,
        "worker",
        |i| i.status == ProcessStatus::Running,
        Duration::from_secs(2),
    )
    .await;
    assert_eq!(info.restart_count, 1);
    assert_eq!(info.last_error, None);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_stops_everything_and_refuses_launches() {
    let (engine, _factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();
    engine
        .start_go_bin(spec("worker").with_keep_alive(true))
        .await
        .unwrap();

    engine.shutdown().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Stopped);

    let status = engine.monit_status().await.unwrap();
    assert_eq!(status.procs.len(), 2);
    assert!(status
        .procs
        .iter()
        .all(|p| p.status == ProcessStatus::Stopped && p.pid.is_none()));

    let err = engine.start_go_bin(spec("late")).await.unwrap_err();
    assert_eq!(err.kind(), "operation_not_allowed");
    let err = engine.start_process("api").await.unwrap_err();
    assert_eq!(err.kind(), "operation_not_allowed");
    let err = engine.restart_process("api").await.unwrap_err();
    assert_eq!(err.kind(), "operation_not_allowed");

    // Stop and delete keep working.
    engine.stop_process("api").await.unwrap();
    engine.delete_process("worker").await.unwrap();
    assert_eq!(engine.monit_status().await.unwrap().procs.len(), 1);

    // Repeated shutdown is a no-op.
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_shutdown() {
    let (engine, _factory) = create_engine();
    assert_eq!(engine.state().await, EngineState::Running);
    engine.shutdown().await.unwrap();
    assert_eq!(engine.state().await, EngineState::Stopped);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_op() {
    let (engine, _factory) = create_engine();
    engine.start_go_bin(spec("api")).await.unwrap();

    let sleeper = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .hold("api", Duration::from_millis(200))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let shutdown_start = std::time::Instant::now();
    engine.shutdown().await.unwrap();
    assert!(
        shutdown_start.elapsed() >= Duration::from_millis(100),
        "shutdown should wait for the in-flight op, took {:?}",
        shutdown_start.elapsed()
    );

    sleeper.await.unwrap().unwrap();
    assert_eq!(
        engine.process_info("api").await.unwrap().status,
        ProcessStatus::Stopped
    );
}

// ============================================================================
// Actor plumbing
// ============================================================================

fn spawn_actor_parts(
    factory: Arc<FakeFactory>,
) -> (
    EngineActor,
    mpsc::Receiver<OpOutcome>,
    mpsc::UnboundedReceiver<ExitEvent>,
) {
    let (outcome_tx, outcome_rx) = mpsc::channel::<OpOutcome>(8);
    let (exit_tx, exit_rx) = mpsc::unbounded_channel::<ExitEvent>();
    let actor = EngineActor::new(test_config(test_policy()), factory, exit_tx, outcome_tx);
    (actor, outcome_rx, exit_rx)
}

#[tokio::test]
async fn test_actor_exits_after_command_channel_closes_and_work_drains() {
    let (actor, outcome_rx, exit_rx) = spawn_actor_parts(Arc::new(FakeFactory::default()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(8);
    let join = tokio::spawn(actor.run(cmd_rx, outcome_rx, exit_rx));

    let (launch_tx, launch_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::Launch {
            spec: spec("p1"),
            deadline: None,
            resp: launch_tx,
        })
        .await
        .unwrap();

    let (sleep_tx, sleep_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::Hold {
            name: "p1".to_string(),
            duration: Duration::from_millis(150),
            resp: sleep_tx,
        })
        .await
        .unwrap();

    drop(cmd_tx);

    let launch_res = tokio::time::timeout(Duration::from_secs(2), launch_rx).await;
    assert!(matches!(launch_res, Ok(Ok(Ok(())))), "launch should complete during drain");
    let sleep_res = tokio::time::timeout(Duration::from_secs(2), sleep_rx).await;
    assert!(sleep_res.is_ok(), "Hold oneshot should resolve during drain");

    tokio::time::timeout(Duration::from_secs(2), join)
        .await
        .expect("actor should terminate after drain")
        .unwrap();
}

#[tokio::test]
async fn test_unsubmitted_launch_leaves_crashed_record() {
    let (mut actor, outcome_rx, exit_rx) = spawn_actor_parts(Arc::new(FakeFactory::default()));
    actor.test_close_pool();
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(8);
    let join = tokio::spawn(actor.run(cmd_rx, outcome_rx, exit_rx));

    let (launch_tx, launch_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::Launch {
            spec: spec("late"),
            deadline: None,
            resp: launch_tx,
        })
        .await
        .unwrap();
    let launch_res = tokio::time::timeout(Duration::from_secs(1), launch_rx)
        .await
        .expect("launch should be answered")
        .unwrap();
    assert_eq!(launch_res.unwrap_err().kind(), "unavailable");

    let (info_tx, info_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::GetProcessInfo {
            name: "late".to_string(),
            resp: info_tx,
        })
        .await
        .unwrap();
    let info = info_rx.await.unwrap().unwrap();
    assert_eq!(info.status, ProcessStatus::Crashed);
    assert_eq!(info.pid, None);
    assert!(info.last_error.as_deref().unwrap().contains("operation pool"));

    let (status_tx, status_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::GetMonitStatus { resp: status_tx })
        .await
        .unwrap();
    let status = status_rx.await.unwrap();
    assert_eq!(status.get("late").unwrap().status, ProcessStatus::Crashed);

    drop(cmd_tx);
    tokio::time::timeout(Duration::from_secs(2), join)
        .await
        .expect("actor should exit once the handles are gone")
        .unwrap();
}

#[tokio::test]
async fn test_actor_terminates_even_if_queued_total_counter_drifts() {
    let (mut actor, outcome_rx, exit_rx) = spawn_actor_parts(Arc::new(FakeFactory::default()));
    actor.test_set_queued_total(1);

    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(8);
    let join = tokio::spawn(actor.run(cmd_rx, outcome_rx, exit_rx));
    drop(cmd_tx);

    tokio::time::timeout(Duration::from_secs(2), join)
        .await
        .expect("actor should terminate even if queued_total is inconsistent")
        .unwrap();
}

#[tokio::test]
async fn test_actor_does_not_hang_if_completion_channel_closes() {
    // The pool reports to a channel nobody reads; the actor's own completion
    // channel is closed by hand below.
    let (pool_outcome_tx, _pool_outcome_rx) = mpsc::channel::<OpOutcome>(8);
    let (actor_outcome_tx, actor_outcome_rx) = mpsc::channel::<OpOutcome>(8);
    let (exit_tx, exit_rx) = mpsc::unbounded_channel::<ExitEvent>();
    let actor = EngineActor::new(
        test_config(test_policy()),
        Arc::new(FakeFactory::default()),
        exit_tx,
        pool_outcome_tx,
    );

    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(8);
    let (launch_tx, launch_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::Launch {
            spec: spec("p1"),
            deadline: None,
            resp: launch_tx,
        })
        .await
        .unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::StopProcess {
            name: "p1".to_string(),
            deadline: None,
            resp: stop_tx,
        })
        .await
        .unwrap();

    // Barrier: the actor has handled both commands once this answers.
    let (state_tx, state_rx) = tokio::sync::oneshot::channel();
    cmd_tx
        .send(EngineCommand::GetEngineState { resp: state_tx })
        .await
        .unwrap();

    let join = tokio::spawn(actor.run(cmd_rx, actor_outcome_rx, exit_rx));
    let _ = tokio::time::timeout(Duration::from_secs(1), state_rx)
        .await
        .expect("actor should answer GetEngineState");

    drop(actor_outcome_tx);
    drop(cmd_tx);

    let launch_res = tokio::time::timeout(Duration::from_secs(2), launch_rx)
        .await
        .expect("launch oneshot should resolve")
        .expect("launch oneshot sender should not be dropped");
    assert_eq!(launch_res.unwrap_err().kind(), "completion_channel_closed");

    let stop_res = tokio::time::timeout(Duration::from_secs(2), stop_rx)
        .await
        .expect("stop oneshot should resolve")
        .expect("stop oneshot sender should not be dropped");
    assert!(stop_res.is_err());

    tokio::time::timeout(Duration::from_secs(2), join)
        .await
        .expect("actor should terminate after forced drain")
        .unwrap();
}

#[tokio::test]
async fn test_pool_without_permits_still_returns_control() {
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<OpOutcome>(1);

    let ticket = ops::OpTicket {
        name: "p1".to_string(),
        op: types::OpKind::Start,
        control: Box::new(FakeControl::detached("p1")),
        batch_id: Some(123),
        limit: Duration::from_secs(1),
    };

    ops::OpPool::serve_without_permits(ticket, outcome_tx).await;

    let completed = tokio::time::timeout(Duration::from_secs(1), outcome_rx.recv())
        .await
        .expect("should receive an outcome")
        .expect("outcome should be sent");

    assert_eq!(completed.name, "p1");
    assert!(completed.control.is_some(), "control handle must be returned");
    assert_eq!(completed.batch_id, Some(123));
    assert!(
        matches!(completed.result, Err(SupervisorError::Unavailable { .. })),
        "expected Unavailable when semaphore is closed, got: {:?}",
        completed.result
    );
}

#[tokio::test]
async fn test_handle_reports_stopped_when_actor_is_gone() {
    let (cmd_tx, cmd_rx) = mpsc::channel::<EngineCommand>(1);
    drop(cmd_rx);
    let engine = LifecycleEngine {
        cmd_tx,
        deadline: None,
    };

    assert_eq!(engine.state().await, EngineState::Stopped);
    let err = engine.stop_process("api").await.unwrap_err();
    assert_eq!(err.kind(), "unavailable");
}
