//! Durable registry of emulators, generated tests, sessions and reports.
//!
//! All listings are in creation order and stable across repeated calls.
//! Upserts replace an existing entry in place (keeping its position) or
//! append a new one, so applying the same upsert twice is a no-op.
//!
//! When opened on a directory, every mutation is written to `registry.json`
//! with write-to-temp + rename before it becomes visible; a failed write
//! leaves the in-memory state untouched.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use phoenix_types::{Emulator, EmulatorStatus, TestCase, VerificationReport, VerificationSession};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::persist;

const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "registry.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestSet {
    emulator_id: String,
    created_at: DateTime<Utc>,
    tests: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryState {
    version: u32,
    emulators: Vec<Emulator>,
    tests: Vec<TestSet>,
    sessions: Vec<VerificationSession>,
    reports: Vec<VerificationReport>,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            emulators: Vec::new(),
            tests: Vec::new(),
            sessions: Vec::new(),
            reports: Vec::new(),
        }
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    path: Option<PathBuf>,
}

impl Registry {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            path: None,
        }
    }

    /// Open (or create) a registry persisted under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);
        let state = match persist::read_json::<RegistryState>(&path)? {
            Some(state) if state.version != STATE_VERSION => {
                return Err(StoreError::VersionMismatch {
                    found: state.version,
                    expected: STATE_VERSION,
                });
            }
            Some(state) => state,
            None => RegistryState::default(),
        };
        tracing::info!(
            path = %path.display(),
            emulators = state.emulators.len(),
            reports = state.reports.len(),
            "Opened registry"
        );
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation atomically: persisted first, then made visible.
    fn commit<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> StoreResult<R> {
        let mut state = self.lock();
        let Some(path) = &self.path else {
            return Ok(f(&mut state));
        };
        let mut next = state.clone();
        let out = f(&mut next);
        persist::write_json_atomic(path, &next)?;
        *state = next;
        Ok(out)
    }

    // ── Emulators ────────────────────────────────────────────────────

    pub fn upsert_emulator(&self, emulator: Emulator) -> StoreResult<()> {
        self.commit(|s| upsert_by(&mut s.emulators, emulator, |e| e.id.clone()))
    }

    /// Register `emulator` unless its id is taken. Returns the registered
    /// entry and whether it was newly inserted.
    pub fn insert_emulator_if_absent(&self, emulator: Emulator) -> StoreResult<(Emulator, bool)> {
        if let Some(existing) = self.get_emulator(&emulator.id) {
            return Ok((existing, false));
        }
        self.commit(|s| match s.emulators.iter().find(|e| e.id == emulator.id) {
            Some(existing) => (existing.clone(), false),
            None => {
                s.emulators.push(emulator.clone());
                (emulator, true)
            }
        })
    }

    pub fn set_emulator_status(&self, id: &str, status: EmulatorStatus) -> StoreResult<Option<Emulator>> {
        self.commit(|s| {
            s.emulators.iter_mut().find(|e| e.id == id).map(|e| {
                e.status = status;
                e.clone()
            })
        })
    }

    pub fn get_emulator(&self, id: &str) -> Option<Emulator> {
        self.lock().emulators.iter().find(|e| e.id == id).cloned()
    }

    pub fn list_emulators(&self) -> Vec<Emulator> {
        self.lock().emulators.clone()
    }

    /// Emulators whose vendor matches case-insensitively.
    pub fn list_emulators_by_vendor(&self, vendor: &str) -> Vec<Emulator> {
        self.lock()
            .emulators
            .iter()
            .filter(|e| e.vendor.eq_ignore_ascii_case(vendor))
            .cloned()
            .collect()
    }

    // ── Tests ────────────────────────────────────────────────────────

    /// Merge tests into the emulator's set by test id.
    pub fn upsert_tests(&self, emulator_id: &str, tests: Vec<TestCase>) -> StoreResult<usize> {
        self.commit(|s| {
            let idx = match s.tests.iter().position(|t| t.emulator_id == emulator_id) {
                Some(idx) => idx,
                None => {
                    s.tests.push(TestSet {
                        emulator_id: emulator_id.to_string(),
                        created_at: Utc::now(),
                        tests: Vec::new(),
                    });
                    s.tests.len() - 1
                }
            };
            let set = &mut s.tests[idx].tests;
            for test in tests {
                upsert_by(set, test, |t| t.id.clone());
            }
            set.len()
        })
    }

    /// Tests registered for an emulator; empty for unknown emulators.
    pub fn list_tests(&self, emulator_id: &str) -> Vec<TestCase> {
        self.lock()
            .tests
            .iter()
            .find(|t| t.emulator_id == emulator_id)
            .map(|t| t.tests.clone())
            .unwrap_or_default()
    }

    // ── Sessions ─────────────────────────────────────────────────────

    pub fn upsert_session(&self, session: VerificationSession) -> StoreResult<()> {
        self.commit(|s| upsert_by(&mut s.sessions, session, |x| x.id.clone()))
    }

    /// Persist a session together with its report in one commit, so a
    /// terminal session and its report appear (or not) together.
    pub fn record_outcome(
        &self,
        session: VerificationSession,
        report: Option<VerificationReport>,
    ) -> StoreResult<()> {
        self.commit(|s| {
            upsert_by(&mut s.sessions, session, |x| x.id.clone());
            if let Some(report) = report {
                upsert_by(&mut s.reports, report, |r| r.report_id.clone());
            }
        })
    }

    pub fn get_session(&self, id: &str) -> Option<VerificationSession> {
        self.lock().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn list_sessions(&self) -> Vec<VerificationSession> {
        self.lock().sessions.clone()
    }

    // ── Reports ──────────────────────────────────────────────────────

    pub fn upsert_report(&self, report: VerificationReport) -> StoreResult<()> {
        self.commit(|s| upsert_by(&mut s.reports, report, |r| r.report_id.clone()))
    }

    pub fn get_report(&self, report_id: &str) -> Option<VerificationReport> {
        self.lock()
            .reports
            .iter()
            .find(|r| r.report_id == report_id)
            .cloned()
    }

    /// The most recent report produced for a session.
    pub fn report_for_session(&self, session_id: &str) -> Option<VerificationReport> {
        self.lock()
            .reports
            .iter()
            .rev()
            .find(|r| r.session_id.as_deref() == Some(session_id))
            .cloned()
    }

    pub fn list_reports(&self) -> Vec<VerificationReport> {
        self.lock().reports.clone()
    }

    pub fn list_reports_for(&self, emulator_id: &str) -> Vec<VerificationReport> {
        self.lock()
            .reports
            .iter()
            .filter(|r| r.emulator_id == emulator_id)
            .cloned()
            .collect()
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn upsert_by<T>(items: &mut Vec<T>, item: T, key: impl Fn(&T) -> String) {
    let k = key(&item);
    match items.iter_mut().find(|x| key(x) == k) {
        Some(slot) => *slot = item,
        None => items.push(item),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_types::{Severity, TestCategory};

    fn tc(id: &str) -> TestCase {
        TestCase::new(id, id, TestCategory::Boot, Severity::High)
    }

    #[test]
    fn test_upsert_emulator_is_idempotent() {
        let reg = Registry::in_memory();
        let emu = Emulator::new("EMU-1", "board");
        reg.upsert_emulator(emu.clone()).unwrap();
        reg.upsert_emulator(emu.clone()).unwrap();
        assert_eq!(reg.list_emulators(), vec![emu]);
    }

    #[test]
    fn test_upsert_keeps_creation_order() {
        let reg = Registry::in_memory();
        reg.upsert_emulator(Emulator::new("A", "a")).unwrap();
        reg.upsert_emulator(Emulator::new("B", "b")).unwrap();
        let mut a = Emulator::new("A", "renamed");
        a.vendor = "acme".into();
        reg.upsert_emulator(a).unwrap();

        let ids: Vec<String> = reg.list_emulators().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(reg.get_emulator("A").unwrap().board_name, "renamed");
    }

    #[test]
    fn test_insert_if_absent_reuses_existing() {
        let reg = Registry::in_memory();
        let (first, inserted) = reg.insert_emulator_if_absent(Emulator::new("E", "one")).unwrap();
        assert!(inserted);
        let (second, inserted) = reg.insert_emulator_if_absent(Emulator::new("E", "two")).unwrap();
        assert!(!inserted);
        assert_eq!(second, first);
        assert_eq!(reg.list_emulators().len(), 1);
    }

    #[test]
    fn test_tests_merge_by_id() {
        let reg = Registry::in_memory();
        assert_eq!(reg.upsert_tests("E", vec![tc("T1"), tc("T2")]).unwrap(), 2);
        assert_eq!(reg.upsert_tests("E", vec![tc("T2"), tc("T3")]).unwrap(), 3);
        let ids: Vec<String> = reg.list_tests("E").into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn test_unknown_emulator_has_no_tests() {
        let reg = Registry::in_memory();
        assert!(reg.list_tests("missing").is_empty());
    }

    #[test]
    fn test_set_status_on_unknown_emulator() {
        let reg = Registry::in_memory();
        assert!(reg.set_emulator_status("nope", EmulatorStatus::Busy).unwrap().is_none());
    }

    #[test]
    fn test_vendor_filter_is_case_insensitive() {
        let reg = Registry::in_memory();
        let mut a = Emulator::new("A", "a");
        a.vendor = "Broadcom".into();
        reg.upsert_emulator(a).unwrap();
        reg.upsert_emulator(Emulator::new("B", "b")).unwrap();
        assert_eq!(reg.list_emulators_by_vendor("broadcom").len(), 1);
    }
}
