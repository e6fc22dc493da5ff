use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use phoenix_types::{Emulator, Firmware, TestCase};

/// Errors a backend may report instead of a test verdict.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Communication hiccup; the same call may succeed if retried.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// The emulator cannot be reached and will not come back for this run.
    #[error("Emulator unavailable: {0}")]
    Unavailable(String),

    /// The backend itself broke while running this one test.
    #[error("Backend fault: {0}")]
    Fault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    Failed,
}

/// What the backend observed while running one test.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutcome {
    pub status: RunStatus,
    pub diagnostics: Vec<String>,
}

impl BackendOutcome {
    pub fn passed() -> Self {
        Self {
            status: RunStatus::Passed,
            diagnostics: Vec::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            diagnostics: vec![reason.into()],
        }
    }
}

/// Runs a single test case against a firmware image on an emulator.
#[async_trait]
pub trait EmulatorBackend: Send + Sync {
    async fn run_test(
        &self,
        emulator: &Emulator,
        test: &TestCase,
        firmware: &Firmware,
    ) -> Result<BackendOutcome, BackendError>;
}

/// Backend with per-test scripted outcomes. Unscripted tests pass.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<Result<BackendOutcome, BackendError>>>>,
    /// After this many calls every call fails transiently.
    down_after: Option<usize>,
    delay: Duration,
    calls: AtomicUsize,
    invoked: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive calls with `test_id`.
    pub fn script(
        mut self,
        test_id: &str,
        outcomes: impl IntoIterator<Item = Result<BackendOutcome, BackendError>>,
    ) -> Self {
        self.scripts
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(test_id.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn fail(self, test_id: &str) -> Self {
        self.script(test_id, [Ok(BackendOutcome::failed("assertion failed"))])
    }

    pub fn unreachable_after(mut self, calls: usize) -> Self {
        self.down_after = Some(calls);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Test ids in call order, retries included.
    pub fn invoked(&self) -> Vec<String> {
        self.invoked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EmulatorBackend for ScriptedBackend {
    async fn run_test(
        &self,
        _emulator: &Emulator,
        test: &TestCase,
        _firmware: &Firmware,
    ) -> Result<BackendOutcome, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.invoked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(test.id.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.down_after.is_some_and(|limit| n >= limit) {
            return Err(BackendError::Transient("connection refused".into()));
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&test.id)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(BackendOutcome::passed()))
    }
}
