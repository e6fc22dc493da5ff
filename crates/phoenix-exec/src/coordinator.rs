//! Ordered suite execution with per-test retry and timeout.
//!
//! Tests run strictly in the order given. For each test the coordinator logs
//! a start line, calls the backend, logs the backend's diagnostics, then logs
//! a terminal line and records exactly one [`TestResult`].
//!
//! Failure handling per test:
//! - `Failed` from the backend is an assertion failure: recorded, never retried.
//! - `Transient` errors are retried with exponential backoff. When the retry
//!   budget is exhausted the emulator is treated as unreachable.
//! - `Unavailable` means unreachable immediately.
//! - `Fault` marks that one test `error` and execution continues.
//! - Exceeding the per-test budget marks that one test `error`.
//!
//! Once the emulator is unreachable no further test is attempted; every
//! remaining test is recorded as `error` with zero duration and the outcome
//! carries a session-level failure.

use std::sync::Arc;
use std::time::Duration;

use phoenix_store::LogBuffer;
use phoenix_types::{Emulator, Firmware, TestCase, TestResult, TestStatus, VerifyError, VerifyResult};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::{BackendError, BackendOutcome, EmulatorBackend, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub retry: RetryPolicy,
    /// Upper bound on any single test's budget, whatever the test asks for.
    pub max_test_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_test_timeout_secs: 300,
        }
    }
}

impl ExecutionConfig {
    pub fn test_budget(&self, test: &TestCase) -> Duration {
        Duration::from_secs(test.timeout_sec.min(self.max_test_timeout_secs))
    }
}

/// Results of one suite run. `results` has one entry per test, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub results: Vec<TestResult>,
    /// Set when execution could not proceed (emulator unreachable).
    pub failure: Option<VerifyError>,
}

impl ExecutionOutcome {
    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Why a single test did not produce a verdict.
enum Interruption {
    /// The emulator is gone; stop the suite.
    Unreachable(String),
    /// Only this test is affected.
    Fault(String),
}

pub struct TestExecutionCoordinator {
    backend: Arc<dyn EmulatorBackend>,
    logs: Arc<LogBuffer>,
    config: ExecutionConfig,
}

impl TestExecutionCoordinator {
    pub fn new(backend: Arc<dyn EmulatorBackend>, logs: Arc<LogBuffer>, config: ExecutionConfig) -> Self {
        Self {
            backend,
            logs,
            config,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Run `tests` in order against `emulator`, streaming logs under
    /// `session_id`.
    pub async fn execute(
        &self,
        session_id: &str,
        emulator: &Emulator,
        tests: &[TestCase],
        firmware: &Firmware,
    ) -> ExecutionOutcome {
        let mut results = Vec::with_capacity(tests.len());
        let failure = match self
            .run_suite(session_id, emulator, tests, firmware, &mut results)
            .await
        {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        if let Some(reason) = &failure {
            let remaining = tests.len() - results.len();
            for test in &tests[results.len()..] {
                results.push(TestResult::not_run(&test.id, "not run: execution aborted"));
            }
            tracing::warn!(
                session_id,
                emulator_id = %emulator.id,
                remaining,
                error = %reason,
                "Execution aborted"
            );
            // Best effort: the log stream itself may be what failed.
            let _ = self.emit(
                session_id,
                format!("ABORT: {reason}; {remaining} remaining test(s) recorded as error"),
            );
        }

        let outcome = ExecutionOutcome { results, failure };
        let _ = self.emit(
            session_id,
            format!(
                "Execution finished: {} passed, {} failed, {} error",
                outcome.count(TestStatus::Passed),
                outcome.count(TestStatus::Failed),
                outcome.count(TestStatus::Error),
            ),
        );
        outcome
    }

    /// Runs tests until done or until the emulator is lost. Results for
    /// every attempted test are pushed to `results` before returning.
    async fn run_suite(
        &self,
        session_id: &str,
        emulator: &Emulator,
        tests: &[TestCase],
        firmware: &Firmware,
        results: &mut Vec<TestResult>,
    ) -> VerifyResult<()> {
        let total = tests.len();
        self.emit(
            session_id,
            format!(
                "Starting {total} test(s) on {} with firmware {}",
                emulator.id,
                firmware.sha256()
            ),
        )?;

        for (idx, test) in tests.iter().enumerate() {
            self.emit(
                session_id,
                format!("[{}/{total}] START {} - {}", idx + 1, test.id, test.name),
            )?;

            let started = Instant::now();
            let budget = self.config.test_budget(test);
            let attempt = tokio::time::timeout(
                budget,
                self.run_with_retries(session_id, emulator, test, firmware),
            )
            .await;
            let elapsed = started.elapsed().as_secs_f64();

            let (result, abort) = match attempt {
                Ok(Ok(outcome)) => {
                    for line in &outcome.diagnostics {
                        self.emit(session_id, format!("  {line}"))?;
                    }
                    let status = match outcome.status {
                        RunStatus::Passed => TestStatus::Passed,
                        RunStatus::Failed => TestStatus::Failed,
                    };
                    (TestResult::new(&test.id, status, elapsed), None)
                }
                Ok(Err(Interruption::Fault(msg))) => {
                    let err = VerifyError::Execution(msg);
                    (TestResult::new(&test.id, TestStatus::Error, elapsed).with_message(err.to_string()), None)
                }
                Ok(Err(Interruption::Unreachable(msg))) => {
                    let err = VerifyError::Execution(format!("emulator {} unreachable: {msg}", emulator.id));
                    (
                        TestResult::new(&test.id, TestStatus::Error, elapsed).with_message(err.to_string()),
                        Some(err),
                    )
                }
                Err(_elapsed) => {
                    let err = VerifyError::Timeout {
                        test_id: test.id.clone(),
                        limit_secs: budget.as_secs(),
                    };
                    (TestResult::new(&test.id, TestStatus::Error, elapsed).with_message(err.to_string()), None)
                }
            };

            let detail = result
                .message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default();
            self.emit(
                session_id,
                format!(
                    "[{}/{total}] END {} {} ({elapsed:.3}s){detail}",
                    idx + 1,
                    test.id,
                    result.status.as_str().to_ascii_uppercase(),
                ),
            )?;
            tracing::debug!(session_id, test_id = %test.id, status = result.status.as_str(), "Test finished");
            results.push(result);

            if let Some(err) = abort {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn run_with_retries(
        &self,
        session_id: &str,
        emulator: &Emulator,
        test: &TestCase,
        firmware: &Firmware,
    ) -> Result<BackendOutcome, Interruption> {
        let policy = &self.config.retry;
        let mut retry = 0;
        loop {
            match self.backend.run_test(emulator, test, firmware).await {
                Ok(outcome) => return Ok(outcome),
                Err(BackendError::Transient(msg)) if retry < policy.max_retries => {
                    let delay = policy.backoff(retry);
                    retry += 1;
                    self.emit(
                        session_id,
                        format!(
                            "  transient error ({msg}); retry {retry}/{} in {} ms",
                            policy.max_retries,
                            delay.as_millis()
                        ),
                    )
                    .map_err(|e| Interruption::Unreachable(e.to_string()))?;
                    tokio::time::sleep(delay).await;
                }
                Err(BackendError::Transient(msg)) => {
                    return Err(Interruption::Unreachable(format!(
                        "{msg} (gave up after {} attempts)",
                        retry + 1
                    )));
                }
                Err(BackendError::Unavailable(msg)) => return Err(Interruption::Unreachable(msg)),
                Err(BackendError::Fault(msg)) => return Err(Interruption::Fault(msg)),
            }
        }
    }

    fn emit(&self, session_id: &str, message: String) -> VerifyResult<()> {
        self.logs.append(session_id, message)?;
        Ok(())
    }
}
