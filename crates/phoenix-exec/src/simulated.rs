use std::time::Duration;

use async_trait::async_trait;
use phoenix_types::{Emulator, Firmware, TestCase};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::backend::{BackendError, BackendOutcome, EmulatorBackend, RunStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// RNG seed for reproducibility.
    pub seed: u64,
    /// Probability that a single test passes (0.0-1.0).
    pub pass_probability: f64,
    /// Simulated time spent per test step.
    pub step_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            pass_probability: 0.9,
            step_delay_ms: 0,
        }
    }
}

/// Backend that simulates test runs without hardware.
///
/// Outcomes are drawn from a ChaCha8 stream keyed by the seed, the firmware
/// digest and the test id, so re-running the same firmware reproduces the
/// same verdicts regardless of suite order.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    config: SimulationConfig,
}

impl SimulatedBackend {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    fn rng_for(&self, firmware: &Firmware, test: &TestCase) -> ChaCha8Rng {
        let mut hasher = Sha256::new();
        hasher.update(self.config.seed.to_le_bytes());
        hasher.update(firmware.sha256().as_bytes());
        hasher.update(test.id.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        ChaCha8Rng::from_seed(seed)
    }
}

#[async_trait]
impl EmulatorBackend for SimulatedBackend {
    async fn run_test(
        &self,
        emulator: &Emulator,
        test: &TestCase,
        firmware: &Firmware,
    ) -> Result<BackendOutcome, BackendError> {
        let (passed, mut diagnostics) = {
            let mut rng = self.rng_for(firmware, test);
            let passed = rng.gen_bool(self.config.pass_probability.clamp(0.0, 1.0));
            let diagnostics: Vec<String> = if test.steps.is_empty() {
                vec![format!("{}: executed on {}", test.name, emulator.board_name)]
            } else {
                test.steps
                    .iter()
                    .enumerate()
                    .map(|(i, step)| format!("step {}: {}", i + 1, step.action))
                    .collect()
            };
            (passed, diagnostics)
        };

        let delay = Duration::from_millis(self.config.step_delay_ms);
        if !delay.is_zero() {
            for _ in 0..test.steps.len().max(1) {
                tokio::time::sleep(delay).await;
            }
        }

        let status = if passed {
            RunStatus::Passed
        } else {
            let expected = test
                .steps
                .last()
                .map(|s| s.expected.as_str())
                .or_else(|| test.expected_results.first().map(String::as_str))
                .unwrap_or("expected behaviour");
            diagnostics.push(format!("assertion failed: {expected}"));
            RunStatus::Failed
        };
        Ok(BackendOutcome { status, diagnostics })
    }
}
