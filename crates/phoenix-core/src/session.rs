//! Verification session state machine.
//!
//! A session moves `uploaded -> running -> {completed, failed}` and never
//! leaves a terminal state. An uploaded session that will never run can be
//! abandoned straight to `failed`. `run` only schedules execution; callers observe
//! progress by polling [`SessionManager::logs`] and
//! [`SessionManager::get_status`].
//!
//! Per-emulator leases guarantee at most one running session per emulator.
//! The emulator's registry status mirrors its lease: `busy` while a session
//! runs, `reserved` while uploaded sessions wait, `ready` otherwise.
//!
//! Lock order: `sessions` before `leases`. The registry and log buffer have
//! their own internal locks and never call back into the manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use phoenix_exec::{ExecutionOutcome, TestExecutionCoordinator};
use phoenix_report::{ReportAggregator, ReportContext};
use phoenix_store::{LogBuffer, Registry};
use phoenix_types::{
    new_id, EmulatorStatus, EntityKind, Firmware, LogEntry, SessionState, TestCase,
    VerificationReport, VerificationSession, VerifyError, VerifyResult,
};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::InputLimits;
use crate::status::{Component, ComponentStatus, StatusBoard};

/// Response to a log poll.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    /// Session state observed before the logs were read. When terminal, the
    /// page (together with earlier pages) holds the complete history.
    pub status: SessionState,
}

struct SessionSlot {
    session: VerificationSession,
    /// Suite snapshotted at creation.
    tests: Arc<Vec<TestCase>>,
    /// Dropped once execution starts.
    firmware: Option<Firmware>,
    report: Option<VerificationReport>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionSlot {
    fn new(session: VerificationSession, tests: Vec<TestCase>, firmware: Option<Firmware>) -> Self {
        let (state_tx, _) = watch::channel(session.state);
        Self {
            session,
            tests: Arc::new(tests),
            firmware,
            report: None,
            state_tx,
        }
    }
}

#[derive(Debug, Default)]
struct EmulatorLease {
    /// Uploaded sessions waiting to run.
    pending: usize,
    /// The one session currently running.
    active: Option<String>,
}

pub struct SessionManager {
    registry: Arc<Registry>,
    logs: Arc<LogBuffer>,
    coordinator: Arc<TestExecutionCoordinator>,
    aggregator: ReportAggregator,
    limits: InputLimits,
    status: Arc<StatusBoard>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    leases: Mutex<HashMap<String, EmulatorLease>>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<Registry>,
        logs: Arc<LogBuffer>,
        coordinator: Arc<TestExecutionCoordinator>,
        aggregator: ReportAggregator,
        limits: InputLimits,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            registry,
            logs,
            coordinator,
            aggregator,
            limits,
            status,
            sessions: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, EmulatorLease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Upload ───────────────────────────────────────────────────────

    /// Upload firmware against a registered emulator. The session's test
    /// suite is the emulator's registered tests at this moment.
    pub fn create(&self, emulator_id: &str, firmware: Vec<u8>) -> VerifyResult<VerificationSession> {
        let tests = self.registry.list_tests(emulator_id);
        self.create_with_tests(emulator_id, Firmware::new(firmware), tests, None)
    }

    /// Upload firmware with an explicit suite, optionally on behalf of a
    /// workflow.
    pub fn create_with_tests(
        &self,
        emulator_id: &str,
        firmware: Firmware,
        tests: Vec<TestCase>,
        workflow_id: Option<String>,
    ) -> VerifyResult<VerificationSession> {
        let emulator = self
            .registry
            .get_emulator(emulator_id)
            .ok_or_else(|| VerifyError::not_found(EntityKind::Emulator, emulator_id))?;
        self.limits.check_firmware(firmware.size())?;

        let mut sessions = self.sessions();
        let mut leases = self.leases();
        let lease = leases.entry(emulator_id.to_string()).or_default();

        let effective = if lease.active.is_some() {
            EmulatorStatus::Busy
        } else {
            emulator.status
        };
        if !effective.accepts_uploads() {
            return Err(VerifyError::conflict(format!(
                "emulator {emulator_id} is {effective} and cannot accept firmware"
            )));
        }

        let session = VerificationSession {
            id: new_id("SES"),
            emulator_id: emulator_id.to_string(),
            firmware_sha256: firmware.sha256().to_string(),
            firmware_size: firmware.size(),
            state: SessionState::Uploaded,
            created_at: Utc::now(),
            completed_at: None,
            workflow_id,
            failure: None,
        };
        self.registry.upsert_session(session.clone())?;

        lease.pending += 1;
        let status = lease_status(lease);
        self.registry.set_emulator_status(emulator_id, status)?;

        tracing::info!(
            session_id = %session.id,
            emulator_id,
            sha256 = %session.firmware_sha256,
            size = session.firmware_size,
            tests = tests.len(),
            "Session created"
        );
        sessions.insert(session.id.clone(), SessionSlot::new(session.clone(), tests, Some(firmware)));
        Ok(session)
    }

    // ── Run ──────────────────────────────────────────────────────────

    /// Start executing an uploaded session and return immediately.
    pub fn run(self: &Arc<Self>, session_id: &str) -> VerifyResult<()> {
        let runtime = Handle::try_current()
            .map_err(|_| VerifyError::Execution("no async runtime available to run sessions".into()))?;

        let mut sessions = self.sessions();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| VerifyError::not_found(EntityKind::Session, session_id))?;
        if slot.session.state != SessionState::Uploaded {
            return Err(VerifyError::conflict(format!(
                "session {session_id} is {}; only uploaded sessions can run",
                slot.session.state
            )));
        }
        let Some(firmware) = slot.firmware.clone() else {
            return Err(VerifyError::conflict(format!(
                "firmware for session {session_id} was not retained across restart; upload it again"
            )));
        };
        let emulator_id = slot.session.emulator_id.clone();
        let emulator = self
            .registry
            .get_emulator(&emulator_id)
            .ok_or_else(|| VerifyError::not_found(EntityKind::Emulator, &emulator_id))?;

        let mut leases = self.leases();
        let lease = leases.entry(emulator_id.clone()).or_default();
        if let Some(active) = &lease.active {
            return Err(VerifyError::conflict(format!(
                "emulator {emulator_id} is busy with session {active}"
            )));
        }

        let mut running = slot.session.clone();
        running.state = SessionState::Running;
        self.registry.upsert_session(running.clone())?;
        lease.pending = lease.pending.saturating_sub(1);
        lease.active = Some(session_id.to_string());
        if let Err(e) = self.registry.set_emulator_status(&emulator_id, EmulatorStatus::Busy) {
            // Roll the lease back; the registry still says uploaded-or-running
            // for the session, so rewrite it as uploaded.
            lease.active = None;
            lease.pending += 1;
            let _ = self.registry.upsert_session(slot.session.clone());
            return Err(e.into());
        }
        drop(leases);

        slot.session = running;
        slot.firmware = None;
        slot.state_tx.send_replace(SessionState::Running);
        let tests = Arc::clone(&slot.tests);
        drop(sessions);

        self.status.set(Component::TestExecutor, ComponentStatus::Running);
        tracing::info!(session_id, emulator_id = %emulator.id, tests = tests.len(), "Session running");

        let sid = session_id.to_string();
        let worker = {
            let manager = Arc::clone(self);
            let sid = sid.clone();
            let tests = Arc::clone(&tests);
            runtime.spawn(async move {
                manager
                    .coordinator
                    .execute(&sid, &emulator, &tests, &firmware)
                    .await
            })
        };
        let manager = Arc::clone(self);
        runtime.spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => ExecutionOutcome {
                    results: Vec::new(),
                    failure: Some(VerifyError::Execution(format!("execution task failed: {e}"))),
                },
            };
            manager.finish(&sid, outcome);
        });
        Ok(())
    }

    /// Record the outcome of a finished run: the terminal state and its
    /// report in one registry commit, then release the emulator.
    fn finish(&self, session_id: &str, outcome: ExecutionOutcome) {
        let Some((session, tests)) = self
            .sessions()
            .get(session_id)
            .map(|s| (s.session.clone(), Arc::clone(&s.tests)))
        else {
            tracing::error!(session_id, "Finished session is unknown");
            return;
        };

        let state = if outcome.failure.is_some() {
            SessionState::Failed
        } else {
            SessionState::Completed
        };
        let board_name = self
            .registry
            .get_emulator(&session.emulator_id)
            .map(|e| e.board_name)
            .unwrap_or_default();

        self.status.set(Component::ReportGenerator, ComponentStatus::Running);
        let report = self.aggregator.report(
            ReportContext {
                session_id: Some(session.id.clone()),
                workflow_id: session.workflow_id.clone(),
                emulator_id: session.emulator_id.clone(),
                board_name,
                firmware: Some(session.firmware_info()),
            },
            &outcome.results,
            &tests,
        );

        let mut sessions = self.sessions();
        let mut leases = self.leases();
        let Some(slot) = sessions.get_mut(session_id) else {
            return;
        };
        if !slot.session.state.can_transition_to(state) {
            tracing::error!(session_id, from = %slot.session.state, to = %state, "Illegal session transition");
            return;
        }
        let mut finished = slot.session.clone();
        finished.state = state;
        finished.completed_at = Some(Utc::now());
        finished.failure = outcome.failure.as_ref().map(ToString::to_string);

        match self.registry.record_outcome(finished.clone(), Some(report.clone())) {
            Ok(()) => self.status.set(Component::ReportGenerator, ComponentStatus::Completed),
            Err(e) => {
                self.status.set(Component::ReportGenerator, ComponentStatus::Failed);
                tracing::error!(session_id, error = %e, "Failed to persist session outcome");
            }
        }
        slot.session = finished;
        slot.report = Some(report);

        let emulator_id = slot.session.emulator_id.clone();
        let lease = leases.entry(emulator_id.clone()).or_default();
        lease.active = None;
        if let Err(e) = self.registry.set_emulator_status(&emulator_id, lease_status(lease)) {
            tracing::error!(emulator_id, error = %e, "Failed to release emulator");
        }
        slot.state_tx.send_replace(state);

        self.status.set(
            Component::TestExecutor,
            if state == SessionState::Completed {
                ComponentStatus::Completed
            } else {
                ComponentStatus::Failed
            },
        );
        tracing::info!(
            session_id,
            emulator_id,
            state = %state,
            verdict = %slot.report.as_ref().map(|r| r.outcome.verdict.to_string()).unwrap_or_default(),
            "Session finished"
        );
    }

    /// Fail an uploaded session that will never run and release its
    /// reservation. Every test in its report is an error.
    pub fn abandon(&self, session_id: &str, reason: &str) -> VerifyResult<VerificationReport> {
        let mut sessions = self.sessions();
        let slot = sessions
            .get_mut(session_id)
            .ok_or_else(|| VerifyError::not_found(EntityKind::Session, session_id))?;
        if slot.session.state != SessionState::Uploaded {
            return Err(VerifyError::conflict(format!(
                "session {session_id} is {}; only uploaded sessions can be abandoned",
                slot.session.state
            )));
        }

        self.logs
            .append(session_id, format!("ABORT: session abandoned before running: {reason}"))?;
        let report = self.unrun_report(&slot.session, &slot.tests);
        let mut failed = slot.session.clone();
        failed.state = SessionState::Failed;
        failed.completed_at = Some(Utc::now());
        failed.failure = Some(reason.to_string());
        self.registry.record_outcome(failed.clone(), Some(report.clone()))?;

        let emulator_id = failed.emulator_id.clone();
        slot.session = failed;
        slot.firmware = None;
        slot.report = Some(report.clone());
        slot.state_tx.send_replace(SessionState::Failed);

        let mut leases = self.leases();
        let lease = leases.entry(emulator_id.clone()).or_default();
        lease.pending = lease.pending.saturating_sub(1);
        self.registry.set_emulator_status(&emulator_id, lease_status(lease))?;

        tracing::warn!(session_id, emulator_id, reason, "Session abandoned");
        Ok(report)
    }

    /// Report for a session whose tests never produced results.
    fn unrun_report(&self, session: &VerificationSession, tests: &[TestCase]) -> VerificationReport {
        let board_name = self
            .registry
            .get_emulator(&session.emulator_id)
            .map(|e| e.board_name)
            .unwrap_or_default();
        self.aggregator.report(
            ReportContext {
                session_id: Some(session.id.clone()),
                workflow_id: session.workflow_id.clone(),
                emulator_id: session.emulator_id.clone(),
                board_name,
                firmware: Some(session.firmware_info()),
            },
            &[],
            tests,
        )
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_session(&self, session_id: &str) -> VerifyResult<VerificationSession> {
        if let Some(slot) = self.sessions().get(session_id) {
            return Ok(slot.session.clone());
        }
        self.registry
            .get_session(session_id)
            .ok_or_else(|| VerifyError::not_found(EntityKind::Session, session_id))
    }

    pub fn get_status(&self, session_id: &str) -> VerifyResult<SessionState> {
        self.get_session(session_id).map(|s| s.state)
    }

    /// Log entries with `sequence >= offset`, plus the current state.
    pub fn logs(&self, session_id: &str, offset: u64) -> VerifyResult<LogPage> {
        // State first: every log line is appended before the terminal state
        // is published, so a terminal status means this read is complete.
        let status = self.get_status(session_id)?;
        Ok(LogPage {
            logs: self.logs.read(session_id, offset),
            status,
        })
    }

    /// The report of a completed or failed session.
    pub fn results(&self, session_id: &str) -> VerifyResult<VerificationReport> {
        let state = self.get_status(session_id)?;
        if !state.is_terminal() {
            return Err(VerifyError::conflict(format!(
                "session {session_id} is {state}; results are available once it completes"
            )));
        }
        let cached = self.sessions().get(session_id).and_then(|s| s.report.clone());
        cached
            .or_else(|| self.registry.report_for_session(session_id))
            .ok_or_else(|| VerifyError::not_found(EntityKind::Report, session_id))
    }

    /// Resolve once the session reaches a terminal state.
    pub async fn wait_for_terminal(&self, session_id: &str) -> VerifyResult<SessionState> {
        let rx = self.sessions().get(session_id).map(|s| s.state_tx.subscribe());
        let Some(mut rx) = rx else {
            return self.get_status(session_id);
        };
        let state = *rx
            .wait_for(SessionState::is_terminal)
            .await
            .map_err(|_| VerifyError::Execution(format!("session {session_id} was dropped")))?;
        Ok(state)
    }

    pub fn list_sessions(&self) -> Vec<VerificationSession> {
        self.registry.list_sessions()
    }

    // ── Restart recovery ─────────────────────────────────────────────

    /// Reconcile persisted state after a restart: sessions left `running`
    /// become `failed` with a best-effort report (replacing any report they
    /// already had), and every emulator is released. Returns the number of sessions failed.
    pub fn recover(&self) -> VerifyResult<usize> {
        let mut failed = 0;
        let mut sessions = self.sessions();

        for mut session in self.registry.list_sessions() {
            if session.state == SessionState::Running {
                let reason = "interrupted by engine restart";
                self.logs
                    .append(&session.id, format!("ABORT: session {reason}; marked failed"))?;

                // A running session has no trustworthy report; replace any
                // in place so the session keeps a single report.
                let tests = self.registry.list_tests(&session.emulator_id);
                let mut report = self.unrun_report(&session, &tests);
                if let Some(stale) = self.registry.report_for_session(&session.id) {
                    report.report_id = stale.report_id;
                }

                session.state = SessionState::Failed;
                session.completed_at = Some(Utc::now());
                session.failure = Some(reason.to_string());
                self.registry.record_outcome(session.clone(), Some(report))?;
                tracing::warn!(session_id = %session.id, "Recovered interrupted session as failed");
                failed += 1;
            }
            sessions
                .entry(session.id.clone())
                .or_insert_with(|| SessionSlot::new(session, Vec::new(), None));
        }
        drop(sessions);

        for emulator in self.registry.list_emulators() {
            if matches!(emulator.status, EmulatorStatus::Busy | EmulatorStatus::Reserved) {
                self.registry.set_emulator_status(&emulator.id, EmulatorStatus::Ready)?;
            }
        }
        self.leases().clear();
        Ok(failed)
    }
}

fn lease_status(lease: &EmulatorLease) -> EmulatorStatus {
    if lease.active.is_some() {
        EmulatorStatus::Busy
    } else if lease.pending > 0 {
        EmulatorStatus::Reserved
    } else {
        EmulatorStatus::Ready
    }
}
