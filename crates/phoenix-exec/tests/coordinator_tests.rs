//! Integration tests for the test execution coordinator.
//!
//! Time is paused so retry backoff and per-test budgets are virtual.

use std::sync::Arc;
use std::time::Duration;

use phoenix_exec::*;
use phoenix_store::LogBuffer;
use phoenix_types::*;

fn suite(n: usize) -> Vec<TestCase> {
    (0..n)
        .map(|i| TestCase::new(format!("T{i}"), format!("test {i}"), TestCategory::Boot, Severity::High))
        .collect()
}

fn setup(backend: ScriptedBackend) -> (Arc<ScriptedBackend>, Arc<LogBuffer>, TestExecutionCoordinator) {
    let backend = Arc::new(backend);
    let logs = Arc::new(LogBuffer::in_memory());
    let coordinator = TestExecutionCoordinator::new(backend.clone(), logs.clone(), ExecutionConfig::default());
    (backend, logs, coordinator)
}

fn messages(logs: &LogBuffer, session: &str) -> Vec<String> {
    logs.read(session, 0).into_iter().map(|e| e.message).collect()
}

#[tokio::test(start_paused = true)]
async fn test_runs_in_order_with_one_result_each() {
    let (backend, logs, coord) = setup(ScriptedBackend::new());
    let tests = suite(4);
    let out = coord
        .execute("SES_1", &Emulator::new("EMU-1", "b"), &tests, &Firmware::new(vec![1u8; 16]))
        .await;

    assert!(out.failure.is_none());
    let ids: Vec<&str> = out.results.iter().map(|r| r.test_id.as_str()).collect();
    assert_eq!(ids, vec!["T0", "T1", "T2", "T3"]);
    assert!(out.results.iter().all(|r| r.status == TestStatus::Passed));
    assert_eq!(backend.invoked(), vec!["T0", "T1", "T2", "T3"]);

    let entries = logs.read("SES_1", 0);
    assert!(entries.iter().enumerate().all(|(i, e)| e.sequence == i as u64));
    let msgs = messages(&logs, "SES_1");
    let start_t1 = msgs.iter().position(|m| m.contains("START T1")).unwrap();
    let end_t0 = msgs.iter().position(|m| m.contains("END T0 PASSED")).unwrap();
    assert!(end_t0 < start_t1);
    assert!(msgs.last().unwrap().starts_with("Execution finished: 4 passed"));
}

#[tokio::test(start_paused = true)]
async fn test_assertion_failures_are_not_retried() {
    let (backend, _logs, coord) = setup(ScriptedBackend::new().fail("T1"));
    let out = coord
        .execute("SES_2", &Emulator::new("EMU-1", "b"), &suite(3), &Firmware::new(vec![1u8]))
        .await;

    assert_eq!(out.results[1].status, TestStatus::Failed);
    assert_eq!(out.count(TestStatus::Passed), 2);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried_with_backoff() {
    let backend = ScriptedBackend::new().script(
        "T0",
        [
            Err(BackendError::Transient("timeout".into())),
            Err(BackendError::Transient("timeout".into())),
            Ok(BackendOutcome::passed()),
        ],
    );
    let (backend, logs, coord) = setup(backend);
    let started = tokio::time::Instant::now();
    let out = coord
        .execute("SES_3", &Emulator::new("EMU-1", "b"), &suite(1), &Firmware::new(vec![1u8]))
        .await;

    assert_eq!(out.results[0].status, TestStatus::Passed);
    assert_eq!(backend.calls(), 3);
    // 200 ms + 400 ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(out.results[0].duration_sec >= 0.6);

    let msgs = messages(&logs, "SES_3");
    assert!(msgs.iter().any(|m| m.contains("retry 1/3 in 200 ms")));
    assert!(msgs.iter().any(|m| m.contains("retry 2/3 in 400 ms")));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_emulator_aborts_remaining_tests() {
    let (backend, logs, coord) = setup(ScriptedBackend::new().unreachable_after(2));
    let out = coord
        .execute("SES_4", &Emulator::new("EMU-1", "b"), &suite(5), &Firmware::new(vec![1u8]))
        .await;

    assert_eq!(out.results.len(), 5);
    assert_eq!(out.count(TestStatus::Passed), 2);
    assert_eq!(out.count(TestStatus::Error), 3);
    assert!(matches!(out.failure, Some(VerifyError::Execution(_))));

    // One first attempt plus three retries for T2, nothing for T3/T4.
    assert_eq!(backend.calls(), 2 + 4);
    assert!(!backend.invoked().iter().any(|id| id == "T3" || id == "T4"));
    assert_eq!(out.results[3].duration_sec, 0.0);
    assert_eq!(out.results[4].duration_sec, 0.0);

    let msgs = messages(&logs, "SES_4");
    assert!(msgs.iter().any(|m| m.starts_with("ABORT:") && m.contains("2 remaining")));
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_aborts_without_retry() {
    let backend = ScriptedBackend::new().script("T1", [Err(BackendError::Unavailable("powered off".into()))]);
    let (backend, _logs, coord) = setup(backend);
    let out = coord
        .execute("SES_5", &Emulator::new("EMU-1", "b"), &suite(3), &Firmware::new(vec![1u8]))
        .await;

    assert_eq!(backend.calls(), 2);
    assert_eq!(out.results[0].status, TestStatus::Passed);
    assert_eq!(out.results[1].status, TestStatus::Error);
    assert_eq!(out.results[2].status, TestStatus::Error);
    assert!(out.failure.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_backend_fault_is_isolated() {
    let backend = ScriptedBackend::new().script("T0", [Err(BackendError::Fault("segfault in harness".into()))]);
    let (_backend, _logs, coord) = setup(backend);
    let out = coord
        .execute("SES_6", &Emulator::new("EMU-1", "b"), &suite(2), &Firmware::new(vec![1u8]))
        .await;

    assert!(out.failure.is_none());
    assert_eq!(out.results[0].status, TestStatus::Error);
    assert!(out.results[0].message.as_deref().unwrap().contains("segfault"));
    assert_eq!(out.results[1].status, TestStatus::Passed);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_marks_only_that_test() {
    let backend = ScriptedBackend::new().with_delay(Duration::from_secs(10));
    let (_backend, logs, coord) = setup(backend);
    let mut tests = suite(2);
    tests[0].timeout_sec = 1;
    tests[1].timeout_sec = 30;

    let out = coord
        .execute("SES_7", &Emulator::new("EMU-1", "b"), &tests, &Firmware::new(vec![1u8]))
        .await;

    assert!(out.failure.is_none());
    assert_eq!(out.results[0].status, TestStatus::Error);
    assert!(out.results[0].message.as_deref().unwrap().contains("1s execution budget"));
    assert!((out.results[0].duration_sec - 1.0).abs() < 0.01);
    assert_eq!(out.results[1].status, TestStatus::Passed);

    let msgs = messages(&logs, "SES_7");
    assert!(msgs.iter().any(|m| m.contains("END T0 ERROR")));
}

#[tokio::test(start_paused = true)]
async fn test_simulated_backend_runs_through_coordinator() {
    let backend = Arc::new(SimulatedBackend::new(SimulationConfig {
        pass_probability: 1.0,
        ..Default::default()
    }));
    let logs = Arc::new(LogBuffer::in_memory());
    let coord = TestExecutionCoordinator::new(backend, logs.clone(), ExecutionConfig::default());
    let out = coord
        .execute("SES_8", &Emulator::new("EMU-1", "board"), &suite(3), &Firmware::new(vec![9u8; 32]))
        .await;
    assert_eq!(out.count(TestStatus::Passed), 3);
    assert!(messages(&logs, "SES_8").iter().any(|m| m.contains("executed on board")));
}
