//! Typed status of the engine's internal components.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    DocumentParser,
    EmulatorSynthesizer,
    Registry,
    BootTestGenerator,
    FeatureTestGenerator,
    TestExecutor,
    ReportGenerator,
}

impl Component {
    pub const ALL: [Component; 7] = [
        Component::DocumentParser,
        Component::EmulatorSynthesizer,
        Component::Registry,
        Component::BootTestGenerator,
        Component::FeatureTestGenerator,
        Component::TestExecutor,
        Component::ReportGenerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentParser => "document_parser",
            Self::EmulatorSynthesizer => "emulator_synthesizer",
            Self::Registry => "registry",
            Self::BootTestGenerator => "boot_test_generator",
            Self::FeatureTestGenerator => "feature_test_generator",
            Self::TestExecutor => "test_executor",
            Self::ReportGenerator => "report_generator",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Last reported status per component. Every component starts `Idle`.
#[derive(Debug)]
pub struct StatusBoard {
    statuses: Mutex<BTreeMap<Component, ComponentStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(
                Component::ALL
                    .iter()
                    .map(|c| (*c, ComponentStatus::Idle))
                    .collect(),
            ),
        }
    }

    pub fn set(&self, component: Component, status: ComponentStatus) {
        tracing::trace!(component = component.as_str(), ?status, "Component status");
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(component, status);
    }

    pub fn get(&self, component: Component) -> ComponentStatus {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&component)
            .copied()
            .unwrap_or(ComponentStatus::Idle)
    }

    pub fn snapshot(&self) -> BTreeMap<Component, ComponentStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
