//! Engine configuration and input limits.
//!
//! Everything has a default; a JSON file may override any subset. Limits are
//! checked before a request mutates anything.

use std::fs;
use std::path::{Path, PathBuf};

use phoenix_exec::{ExecutionConfig, SimulationConfig};
use phoenix_report::AggregatorConfig;
use phoenix_types::VerifyError;
use serde::{Deserialize, Serialize};

/// Caps on caller-supplied inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    /// Maximum firmware image size in bytes.
    pub max_firmware_bytes: u64,
    /// Maximum specification documents per request.
    pub max_spec_documents: usize,
    /// Maximum size of one specification document in bytes.
    pub max_spec_document_bytes: u64,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_firmware_bytes: 256 * 1024 * 1024, // 256 MB
            max_spec_documents: 32,
            max_spec_document_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl InputLimits {
    pub fn check_firmware(&self, size: u64) -> Result<(), LimitViolation> {
        if size == 0 {
            return Err(LimitViolation::EmptyFirmware);
        }
        if size > self.max_firmware_bytes {
            return Err(LimitViolation::FirmwareTooLarge {
                size,
                max: self.max_firmware_bytes,
            });
        }
        Ok(())
    }

    pub fn check_documents<'a>(
        &self,
        documents: impl ExactSizeIterator<Item = (&'a str, u64)>,
    ) -> Result<(), LimitViolation> {
        if documents.len() > self.max_spec_documents {
            return Err(LimitViolation::TooManyDocuments {
                count: documents.len(),
                max: self.max_spec_documents,
            });
        }
        for (name, size) in documents {
            if size > self.max_spec_document_bytes {
                return Err(LimitViolation::DocumentTooLarge {
                    name: name.to_string(),
                    size,
                    max: self.max_spec_document_bytes,
                });
            }
        }
        Ok(())
    }
}

/// An input rejected by [`InputLimits`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitViolation {
    #[error("Firmware image is empty")]
    EmptyFirmware,

    #[error("Firmware too large ({size} bytes, max {max})")]
    FirmwareTooLarge { size: u64, max: u64 },

    #[error("Too many specification documents ({count}, max {max})")]
    TooManyDocuments { count: usize, max: usize },

    #[error("Document {name} too large ({size} bytes, max {max})")]
    DocumentTooLarge { name: String, size: u64, max: u64 },
}

impl From<LimitViolation> for VerifyError {
    fn from(v: LimitViolation) -> Self {
        VerifyError::Validation(v.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for VerifyError {
    fn from(e: ConfigError) -> Self {
        VerifyError::Validation(e.to_string())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: InputLimits,
    pub execution: ExecutionConfig,
    pub report: AggregatorConfig,
    pub simulation: SimulationConfig,
    /// When set, the registry and session logs persist under this directory.
    pub data_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.limits.max_firmware_bytes == 0 {
            return invalid("limits.max_firmware_bytes must be positive");
        }
        if self.limits.max_spec_documents == 0 {
            return invalid("limits.max_spec_documents must be positive");
        }
        if self.execution.max_test_timeout_secs == 0 {
            return invalid("execution.max_test_timeout_secs must be positive");
        }
        if self.execution.retry.base_backoff_ms > self.execution.retry.max_backoff_ms {
            return invalid("execution.retry.base_backoff_ms exceeds max_backoff_ms");
        }
        if !(0.0..=100.0).contains(&self.report.conditional_floor) {
            return invalid("report.conditional_floor must be within 0..=100");
        }
        if !(0.0..=1.0).contains(&self.simulation.pass_probability) {
            return invalid("simulation.pass_probability must be within 0..=1");
        }
        Ok(())
    }
}
