use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::firmware::FirmwareInfo;

/// Generate an identifier of the form `PREFIX_1A2B3C4D`.
pub fn new_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", hex[..8].to_ascii_uppercase())
}

// ── Specification facts ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Feature category a test case belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    Boot,
    Network,
    Wifi,
    Voice,
    Usb,
    Security,
    Management,
    Performance,
    Stress,
    Boundary,
}

impl TestCategory {
    /// Map a free-text category from a specification document.
    /// Unrecognized labels fall back to `Performance`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "network" | "networking" => Self::Network,
            "wifi" | "wireless" => Self::Wifi,
            "voice" | "voip" => Self::Voice,
            "usb" => Self::Usb,
            "security" => Self::Security,
            "management" => Self::Management,
            "boot" => Self::Boot,
            "stress" => Self::Stress,
            "boundary" => Self::Boundary,
            _ => Self::Performance,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Network => "network",
            Self::Wifi => "wifi",
            Self::Voice => "voice",
            Self::Usb => "usb",
            Self::Security => "security",
            Self::Management => "management",
            Self::Performance => "performance",
            Self::Stress => "stress",
            Self::Boundary => "boundary",
        }
    }
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A testable capability extracted from a specification document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub testable: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

fn default_true() -> bool {
    true
}

/// A requirement extracted from a requirement document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub severity: Severity,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub linked_capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSpec {
    #[serde(rename = "type")]
    pub cpu_type: String,
    pub cores: u32,
    pub frequency_mhz: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub size_mb: u64,
}

/// Merged hardware description of a board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    pub soc: String,
    pub vendor: String,
    pub architecture: String,
    pub cpu: CpuSpec,
    pub memory: MemorySpec,
    pub flash: MemorySpec,
    #[serde(default)]
    pub interfaces: Vec<Value>,
    #[serde(default)]
    pub peripherals: Vec<Value>,
}

impl Default for HardwareSpec {
    fn default() -> Self {
        Self {
            soc: "unknown".into(),
            vendor: "unknown".into(),
            architecture: "aarch64".into(),
            cpu: CpuSpec {
                cpu_type: "ARM Cortex-A53".into(),
                cores: 4,
                frequency_mhz: 1500,
            },
            memory: MemorySpec {
                kind: "DDR4".into(),
                size_mb: 1024,
            },
            flash: MemorySpec {
                kind: "NAND".into(),
                size_mb: 256,
            },
            interfaces: Vec::new(),
            peripherals: Vec::new(),
        }
    }
}

// ── Emulators ────────────────────────────────────────────────────────

/// Emulator availability.
///
/// `Reserved` means the emulator is idle but has uploaded sessions waiting
/// to run; it still accepts new uploads. `Busy` means exactly one session is
/// executing against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorStatus {
    Created,
    Ready,
    Reserved,
    Busy,
}

impl EmulatorStatus {
    /// Whether a new session may be uploaded against the emulator.
    pub fn accepts_uploads(&self) -> bool {
        matches!(self, Self::Ready | Self::Reserved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Reserved => "reserved",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for EmulatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered virtual board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emulator {
    pub id: String,
    pub board_name: String,
    pub vendor: String,
    pub soc_id: String,
    pub architecture: String,
    pub hardware: HardwareSpec,
    /// Unique by id.
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub source_documents: Vec<String>,
    pub status: EmulatorStatus,
    pub created_at: DateTime<Utc>,
}

impl Emulator {
    /// A ready emulator with default hardware and no capabilities.
    pub fn new(id: impl Into<String>, board_name: impl Into<String>) -> Self {
        let hardware = HardwareSpec::default();
        Self {
            id: id.into(),
            board_name: board_name.into(),
            vendor: hardware.vendor.clone(),
            soc_id: hardware.soc.clone(),
            architecture: hardware.architecture.clone(),
            hardware,
            capabilities: Vec::new(),
            requirements: Vec::new(),
            source_documents: Vec::new(),
            status: EmulatorStatus::Ready,
            created_at: Utc::now(),
        }
    }
}

// ── Sessions and logs ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uploaded,
    Running,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal transitions: uploaded -> running -> {completed, failed}.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Uploaded, Self::Running)
                | (Self::Uploaded, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One binary-only verification run against one emulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSession {
    pub id: String,
    pub emulator_id: String,
    pub firmware_sha256: String,
    pub firmware_size: u64,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the session was opened by a spec-to-report workflow.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Failure reason for `failed` sessions.
    #[serde(default)]
    pub failure: Option<String>,
}

impl VerificationSession {
    pub fn firmware_info(&self) -> FirmwareInfo {
        FirmwareInfo::new(self.firmware_sha256.clone(), self.firmware_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    /// Gapless per session, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

// ── Tests and results ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStep {
    pub action: String,
    pub expected: String,
}

impl TestStep {
    pub fn new(action: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            expected: expected.into(),
        }
    }
}

/// A generated test case. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub category: TestCategory,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub expected_results: Vec<String>,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub linked_requirements: Vec<String>,
    #[serde(default)]
    pub linked_capabilities: Vec<String>,
}

fn default_timeout_sec() -> u64 {
    60
}

impl TestCase {
    /// A bare test case with a 60 second budget.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: TestCategory,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            severity,
            description: String::new(),
            preconditions: Vec::new(),
            steps: Vec::new(),
            expected_results: Vec::new(),
            timeout_sec: default_timeout_sec(),
            linked_requirements: Vec::new(),
            linked_capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

/// Outcome of one test case within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub status: TestStatus,
    pub duration_sec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestResult {
    pub fn new(test_id: impl Into<String>, status: TestStatus, duration_sec: f64) -> Self {
        Self {
            test_id: test_id.into(),
            status,
            duration_sec,
            message: None,
        }
    }

    /// An `error` result for a test that never ran.
    pub fn not_run(test_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            status: TestStatus::Error,
            duration_sec: 0.0,
            message: Some(reason.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ── Reports ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Conditional,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Conditional => write!(f, "CONDITIONAL"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub passed: usize,
    /// Includes `error` outcomes.
    pub failed: usize,
    pub total: usize,
    pub pass_rate: f64,
    /// How many of `failed` were `error` outcomes.
    #[serde(default)]
    pub errors: usize,
    /// True when there were no tests at all.
    #[serde(default)]
    pub degenerate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCoverage {
    pub passed: usize,
    pub total: usize,
    pub coverage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCoverage {
    pub by_category: BTreeMap<String, CategoryCoverage>,
    #[serde(default)]
    pub total_categories: usize,
    #[serde(default)]
    pub fully_covered: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootAnalysis {
    pub tests_run: usize,
    pub tests_passed: usize,
    pub boot_time_sec: f64,
    pub all_passed: bool,
}

/// The deterministic part of a report: a pure function of the test outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub verdict: Verdict,
    pub summary: Summary,
    pub recommendations: Vec<String>,
    pub feature_coverage: FeatureCoverage,
    pub boot_analysis: BootAnalysis,
    pub duration_sec: f64,
}

/// A persisted verification report. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub report_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub emulator_id: String,
    #[serde(default)]
    pub board_name: String,
    #[serde(default)]
    pub firmware: Option<FirmwareInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: ReportOutcome,
    /// One result per test case, in execution order.
    #[serde(default)]
    pub test_results: Vec<TestResult>,
}

// ── Workflows ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Synthesize,
    GenerateTests,
    Execute,
    Aggregate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Parse,
        Stage::Synthesize,
        Stage::GenerateTests,
        Stage::Execute,
        Stage::Aggregate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Synthesize => "synthesize",
            Self::GenerateTests => "generate_tests",
            Self::Execute => "execute",
            Self::Aggregate => "aggregate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Pending,
    Running,
    Completed,
    /// Finished, but with degraded inputs (e.g. a document failed to parse).
    Degraded { notes: Vec<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

/// The spec-to-report pipeline run. Wraps one verification session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub board_name: String,
    pub stages: Vec<StageRecord>,
    pub current_stage: Option<Stage>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub emulator_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub report_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(board_name: impl Into<String>) -> Self {
        Self {
            id: new_id("WF"),
            board_name: board_name.into(),
            stages: Stage::ALL
                .iter()
                .map(|stage| StageRecord {
                    stage: *stage,
                    outcome: StageOutcome::Pending,
                })
                .collect(),
            current_stage: None,
            status: WorkflowStatus::Running,
            emulator_id: None,
            session_id: None,
            report_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.outcome)
    }

    pub fn set_stage(&mut self, stage: Stage, outcome: StageOutcome) {
        if matches!(outcome, StageOutcome::Running) {
            self.current_stage = Some(stage);
        }
        if let Some(record) = self.stages.iter_mut().find(|r| r.stage == stage) {
            record.outcome = outcome;
        }
    }
}
