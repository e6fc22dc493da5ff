//! Spec-to-report workflow.
//!
//! `parse -> synthesize -> generate_tests -> execute -> aggregate`. A document
//! that fails to parse degrades the parse stage instead of aborting. If
//! execution cannot start, the workflow fails but still records a report in
//! which every test counts as an error. Generated tests are persisted before
//! execution so they stay queryable whatever happens next.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use phoenix_report::{ReportAggregator, ReportContext};
use phoenix_store::Registry;
use phoenix_types::{
    new_id, Emulator, EmulatorStatus, EntityKind, Firmware, SessionState, Stage, StageOutcome,
    Summary, TestCase, Verdict, VerificationReport, VerifyError, VerifyResult, Workflow,
    WorkflowStatus,
};
use serde::Serialize;

use crate::config::InputLimits;
use crate::generate::generate_all;
use crate::parser::{merge_documents, DocumentParser, MergedSpec, ParsedDocument, SpecDocument};
use crate::session::SessionManager;
use crate::status::{Component, ComponentStatus, StatusBoard};

/// Input to [`PipelineOrchestrator::run_workflow`].
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub board_name: String,
    pub documents: Vec<SpecDocument>,
    pub firmware: Vec<u8>,
    /// Reused when it names an existing emulator.
    pub emulator_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub emulator_id: String,
    pub session_id: Option<String>,
    pub tests_generated: usize,
    pub verdict: Verdict,
    pub summary: Summary,
    pub report_id: String,
    pub recommendations: Vec<String>,
    /// One entry per document that failed to parse.
    pub parse_failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmulatorRegistration {
    pub emulator: Emulator,
    /// False when an existing emulator with the requested id was reused.
    pub created: bool,
    pub parse_failures: Vec<String>,
}

pub struct PipelineOrchestrator {
    registry: Arc<Registry>,
    sessions: Arc<SessionManager>,
    parser: Arc<dyn DocumentParser>,
    aggregator: ReportAggregator,
    limits: InputLimits,
    status: Arc<StatusBoard>,
    /// Creation order; the last entry is the latest workflow.
    workflows: Mutex<Vec<Workflow>>,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        sessions: Arc<SessionManager>,
        parser: Arc<dyn DocumentParser>,
        aggregator: ReportAggregator,
        limits: InputLimits,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            registry,
            sessions,
            parser,
            aggregator,
            limits,
            status,
            workflows: Mutex::new(Vec::new()),
        }
    }

    fn workflows(&self) -> MutexGuard<'_, Vec<Workflow>> {
        self.workflows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> VerifyResult<Workflow> {
        self.workflows()
            .iter()
            .find(|w| w.id == workflow_id)
            .cloned()
            .ok_or_else(|| VerifyError::not_found(EntityKind::Workflow, workflow_id))
    }

    pub fn latest_workflow(&self) -> Option<Workflow> {
        self.workflows().last().cloned()
    }

    fn update(&self, workflow_id: &str, f: impl FnOnce(&mut Workflow)) {
        if let Some(wf) = self.workflows().iter_mut().find(|w| w.id == workflow_id) {
            f(wf);
        }
    }

    fn set_stage(&self, workflow_id: &str, stage: Stage, outcome: StageOutcome) {
        tracing::debug!(workflow_id, stage = stage.as_str(), ?outcome, "Workflow stage");
        self.update(workflow_id, |wf| wf.set_stage(stage, outcome));
    }

    // ── Stages 1-2 ───────────────────────────────────────────────────

    /// Parse every document. Failures are collected, not raised.
    pub fn parse_documents(&self, documents: &[SpecDocument]) -> (Vec<ParsedDocument>, Vec<String>) {
        self.status.set(Component::DocumentParser, ComponentStatus::Running);
        let mut parsed = Vec::with_capacity(documents.len());
        let mut failures = Vec::new();
        for doc in documents {
            match self.parser.parse(doc) {
                Ok(p) => parsed.push(p),
                Err(e) => {
                    tracing::warn!(document = %doc.name, error = %e, "Document failed to parse");
                    failures.push(e.to_string());
                }
            }
        }
        let status = if parsed.is_empty() && !failures.is_empty() {
            ComponentStatus::Failed
        } else {
            ComponentStatus::Completed
        };
        self.status.set(Component::DocumentParser, status);
        (parsed, failures)
    }

    /// Parse a single document, surfacing failures as validation errors.
    pub fn parse_document(&self, document: &SpecDocument) -> VerifyResult<ParsedDocument> {
        self.limits.check_documents(std::iter::once((
            document.name.as_str(),
            document.content.len() as u64,
        )))?;
        Ok(self.parser.parse(document)?)
    }

    /// Register an emulator for `spec`. An existing id is reused unchanged.
    fn synthesize(
        &self,
        board_name: &str,
        spec: MergedSpec,
        emulator_id: Option<String>,
    ) -> VerifyResult<(Emulator, bool)> {
        self.status.set(Component::EmulatorSynthesizer, ComponentStatus::Running);
        let hw = spec.hardware;
        let emulator = Emulator {
            id: emulator_id.unwrap_or_else(|| new_id("EMU")),
            board_name: board_name.to_string(),
            vendor: hw.vendor.clone(),
            soc_id: hw.soc.clone(),
            architecture: hw.architecture.clone(),
            hardware: hw,
            capabilities: spec.capabilities,
            requirements: spec.requirements,
            source_documents: spec.source_documents,
            status: EmulatorStatus::Ready,
            created_at: chrono::Utc::now(),
        };

        self.status.set(Component::Registry, ComponentStatus::Running);
        let registered = self.registry.insert_emulator_if_absent(emulator);
        let (emulator, created) = match registered {
            Ok(r) => r,
            Err(e) => {
                self.status.set(Component::Registry, ComponentStatus::Failed);
                self.status.set(Component::EmulatorSynthesizer, ComponentStatus::Failed);
                return Err(e.into());
            }
        };
        self.status.set(Component::Registry, ComponentStatus::Completed);
        self.status.set(Component::EmulatorSynthesizer, ComponentStatus::Completed);

        if created {
            tracing::info!(emulator_id = %emulator.id, board = board_name, "Emulator registered");
        } else {
            tracing::info!(emulator_id = %emulator.id, "Reusing existing emulator");
        }
        Ok((emulator, created))
    }

    fn check_inputs(&self, board_name: &str, documents: &[SpecDocument]) -> VerifyResult<()> {
        if board_name.trim().is_empty() {
            return Err(VerifyError::validation("board_name is required"));
        }
        self.limits.check_documents(
            documents
                .iter()
                .map(|d| (d.name.as_str(), d.content.len() as u64)),
        )?;
        Ok(())
    }

    /// Parse, merge and register, without generating tests.
    pub fn create_emulator(
        &self,
        board_name: &str,
        documents: &[SpecDocument],
        emulator_id: Option<String>,
    ) -> VerifyResult<EmulatorRegistration> {
        self.check_inputs(board_name, documents)?;
        let (parsed, parse_failures) = self.parse_documents(documents);
        let (emulator, created) = self.synthesize(board_name, merge_documents(&parsed), emulator_id)?;
        Ok(EmulatorRegistration {
            emulator,
            created,
            parse_failures,
        })
    }

    // ── Stage 3 ──────────────────────────────────────────────────────

    /// Generate boot and feature tests for an emulator and persist them.
    pub async fn generate_tests(&self, emulator_id: &str) -> VerifyResult<Vec<TestCase>> {
        let emulator = self
            .registry
            .get_emulator(emulator_id)
            .ok_or_else(|| VerifyError::not_found(EntityKind::Emulator, emulator_id))?;

        self.status.set(Component::BootTestGenerator, ComponentStatus::Running);
        self.status.set(Component::FeatureTestGenerator, ComponentStatus::Running);
        let generated = tokio::task::spawn_blocking(move || generate_all(&emulator)).await;
        let generated = match generated {
            Ok(g) => g,
            Err(e) => {
                self.status.set(Component::BootTestGenerator, ComponentStatus::Failed);
                self.status.set(Component::FeatureTestGenerator, ComponentStatus::Failed);
                return Err(VerifyError::Execution(format!("test generation failed: {e}")));
            }
        };
        self.status.set(Component::BootTestGenerator, ComponentStatus::Completed);
        self.status.set(Component::FeatureTestGenerator, ComponentStatus::Completed);
        tracing::info!(
            emulator_id,
            boot = generated.boot.len(),
            feature = generated.feature.len(),
            "Tests generated"
        );

        let suite = generated.into_suite();
        self.registry.upsert_tests(emulator_id, suite.clone())?;
        Ok(suite)
    }

    // ── Full workflow ────────────────────────────────────────────────

    pub async fn run_workflow(&self, request: WorkflowRequest) -> VerifyResult<WorkflowSummary> {
        let WorkflowRequest {
            board_name,
            documents,
            firmware,
            emulator_id,
        } = request;
        self.check_inputs(&board_name, &documents)?;
        self.limits.check_firmware(firmware.len() as u64)?;
        let firmware = Firmware::new(firmware);

        let workflow = Workflow::new(&board_name);
        let wf_id = workflow.id.clone();
        self.workflows().push(workflow);
        tracing::info!(workflow_id = %wf_id, board = %board_name, documents = documents.len(), "Workflow started");

        let result = self
            .drive(&wf_id, &board_name, &documents, firmware, emulator_id)
            .await;
        if let Err(e) = &result {
            tracing::error!(workflow_id = %wf_id, error = %e, "Workflow aborted");
            self.update(&wf_id, |wf| {
                if let Some(stage) = wf.current_stage {
                    wf.set_stage(stage, StageOutcome::Failed { reason: e.to_string() });
                }
                wf.status = WorkflowStatus::Failed;
            });
        }
        result
    }

    async fn drive(
        &self,
        wf_id: &str,
        board_name: &str,
        documents: &[SpecDocument],
        firmware: Firmware,
        emulator_id: Option<String>,
    ) -> VerifyResult<WorkflowSummary> {
        self.set_stage(wf_id, Stage::Parse, StageOutcome::Running);
        let (parsed, parse_failures) = self.parse_documents(documents);
        let parse_outcome = if parse_failures.is_empty() {
            StageOutcome::Completed
        } else {
            StageOutcome::Degraded {
                notes: parse_failures.clone(),
            }
        };
        self.set_stage(wf_id, Stage::Parse, parse_outcome);

        self.set_stage(wf_id, Stage::Synthesize, StageOutcome::Running);
        let (emulator, _) = self.synthesize(board_name, merge_documents(&parsed), emulator_id)?;
        self.update(wf_id, |wf| wf.emulator_id = Some(emulator.id.clone()));
        self.set_stage(wf_id, Stage::Synthesize, StageOutcome::Completed);

        self.set_stage(wf_id, Stage::GenerateTests, StageOutcome::Running);
        let tests = self.generate_tests(&emulator.id).await?;
        self.set_stage(wf_id, Stage::GenerateTests, StageOutcome::Completed);

        self.set_stage(wf_id, Stage::Execute, StageOutcome::Running);
        let mut session_id = None;
        let started = self
            .sessions
            .create_with_tests(&emulator.id, firmware.clone(), tests.clone(), Some(wf_id.to_string()))
            .and_then(|session| {
                session_id = Some(session.id.clone());
                self.sessions.run(&session.id).map(|()| session)
            });

        let (report, status) = match started {
            Ok(session) => {
                self.update(wf_id, |wf| wf.session_id = Some(session.id.clone()));
                let state = self.sessions.wait_for_terminal(&session.id).await?;
                if state == SessionState::Failed {
                    let reason = self
                        .sessions
                        .get_session(&session.id)?
                        .failure
                        .unwrap_or_else(|| "execution failed".into());
                    self.set_stage(wf_id, Stage::Execute, StageOutcome::Failed { reason });
                } else {
                    self.set_stage(wf_id, Stage::Execute, StageOutcome::Completed);
                }

                self.set_stage(wf_id, Stage::Aggregate, StageOutcome::Running);
                let report = self.sessions.results(&session.id)?;
                let status = if state == SessionState::Completed {
                    WorkflowStatus::Completed
                } else {
                    WorkflowStatus::Failed
                };
                (report, status)
            }
            Err(e) => {
                tracing::warn!(workflow_id = wf_id, emulator_id = %emulator.id, error = %e, "Execution could not start");
                let reason = e.to_string();
                self.update(wf_id, |wf| wf.session_id = session_id.clone());
                self.set_stage(wf_id, Stage::Execute, StageOutcome::Failed { reason: reason.clone() });
                self.set_stage(wf_id, Stage::Aggregate, StageOutcome::Running);
                let report = match &session_id {
                    // Created but never started: fail it so it stops holding
                    // the emulator and carries the report itself.
                    Some(id) => self.sessions.abandon(id, &reason)?,
                    None => {
                        let report = self.unstarted_report(wf_id, &emulator, &firmware, &tests);
                        self.registry.upsert_report(report.clone())?;
                        report
                    }
                };
                (report, WorkflowStatus::Failed)
            }
        };

        self.set_stage(wf_id, Stage::Aggregate, StageOutcome::Completed);
        self.update(wf_id, |wf| {
            wf.report_id = Some(report.report_id.clone());
            wf.status = status;
        });
        tracing::info!(
            workflow_id = wf_id,
            verdict = %report.outcome.verdict,
            pass_rate = report.outcome.summary.pass_rate,
            "Workflow finished"
        );

        let current = self.get_workflow(wf_id)?;
        Ok(WorkflowSummary {
            workflow_id: wf_id.to_string(),
            status,
            emulator_id: emulator.id,
            session_id: current.session_id,
            tests_generated: tests.len(),
            verdict: report.outcome.verdict,
            summary: report.outcome.summary,
            report_id: report.report_id,
            recommendations: report.outcome.recommendations,
            parse_failures,
        })
    }

    /// Report for a workflow that could not create a session: every test is
    /// an error.
    fn unstarted_report(
        &self,
        wf_id: &str,
        emulator: &Emulator,
        firmware: &Firmware,
        tests: &[TestCase],
    ) -> VerificationReport {
        tracing::debug!(workflow_id = wf_id, tests = tests.len(), "Writing best-effort report");
        self.aggregator.report(
            ReportContext {
                session_id: None,
                workflow_id: Some(wf_id.to_string()),
                emulator_id: emulator.id.clone(),
                board_name: emulator.board_name.clone(),
                firmware: Some(firmware.info()),
            },
            &[],
            tests,
        )
    }
}
