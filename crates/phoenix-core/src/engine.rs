//! Wiring of stores, managers and the pipeline into one platform.

use std::collections::BTreeMap;
use std::sync::Arc;

use phoenix_exec::{EmulatorBackend, SimulatedBackend, TestExecutionCoordinator};
use phoenix_report::ReportAggregator;
use phoenix_store::{LogBuffer, Registry};
use phoenix_types::{VerifyResult, Workflow};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::parser::{DocumentParser, StructuredDocumentParser};
use crate::pipeline::PipelineOrchestrator;
use crate::session::SessionManager;
use crate::status::{Component, ComponentStatus, StatusBoard};

/// Snapshot returned by `platform_status`.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformStatus {
    pub components: BTreeMap<Component, ComponentStatus>,
    pub latest_workflow: Option<Workflow>,
    /// Session counts keyed by state.
    pub sessions: BTreeMap<String, usize>,
    pub emulators: usize,
    pub reports: usize,
    pub persistent: bool,
}

pub struct Platform {
    config: EngineConfig,
    registry: Arc<Registry>,
    logs: Arc<LogBuffer>,
    sessions: Arc<SessionManager>,
    pipeline: PipelineOrchestrator,
    status: Arc<StatusBoard>,
}

impl Platform {
    /// A platform running tests on the simulated backend.
    pub fn new(config: EngineConfig) -> VerifyResult<Self> {
        let backend = Arc::new(SimulatedBackend::new(config.simulation.clone()));
        Self::with_parts(config, backend, Arc::new(StructuredDocumentParser))
    }

    pub fn with_backend(config: EngineConfig, backend: Arc<dyn EmulatorBackend>) -> VerifyResult<Self> {
        Self::with_parts(config, backend, Arc::new(StructuredDocumentParser))
    }

    /// Build the platform. With a `data_dir`, persisted state is reloaded
    /// and interrupted sessions are recovered before anything else runs.
    pub fn with_parts(
        config: EngineConfig,
        backend: Arc<dyn EmulatorBackend>,
        parser: Arc<dyn DocumentParser>,
    ) -> VerifyResult<Self> {
        config.validate()?;

        let (registry, logs) = match &config.data_dir {
            Some(dir) => (Registry::open(dir)?, LogBuffer::open(dir.join("logs"))?),
            None => (Registry::in_memory(), LogBuffer::in_memory()),
        };
        let registry = Arc::new(registry);
        let logs = Arc::new(logs);
        let status = Arc::new(StatusBoard::new());
        let aggregator = ReportAggregator::new(config.report.clone());

        let coordinator = Arc::new(TestExecutionCoordinator::new(
            backend,
            Arc::clone(&logs),
            config.execution.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            Arc::clone(&logs),
            coordinator,
            aggregator.clone(),
            config.limits.clone(),
            Arc::clone(&status),
        ));
        let recovered = sessions.recover()?;
        if recovered > 0 {
            tracing::warn!(recovered, "Marked interrupted sessions as failed");
        }

        let pipeline = PipelineOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            parser,
            aggregator,
            config.limits.clone(),
            Arc::clone(&status),
        );

        tracing::info!(persistent = registry.is_persistent(), "Platform ready");
        Ok(Self {
            config,
            registry,
            logs,
            sessions,
            pipeline,
            status,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn pipeline(&self) -> &PipelineOrchestrator {
        &self.pipeline
    }

    pub fn status_board(&self) -> &StatusBoard {
        &self.status
    }

    pub fn platform_status(&self) -> PlatformStatus {
        let mut sessions = BTreeMap::new();
        for session in self.sessions.list_sessions() {
            *sessions.entry(session.state.to_string()).or_insert(0) += 1;
        }
        PlatformStatus {
            components: self.status.snapshot(),
            latest_workflow: self.pipeline.latest_workflow(),
            sessions,
            emulators: self.registry.list_emulators().len(),
            reports: self.registry.list_reports().len(),
            persistent: self.registry.is_persistent(),
        }
    }
}
