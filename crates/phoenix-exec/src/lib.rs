//! Test execution against emulators.
//!
//! The [`EmulatorBackend`] trait is the seam to whatever actually runs a test
//! against a firmware image. [`TestExecutionCoordinator`] drives an ordered
//! suite through a backend, streaming session logs and applying the
//! retry/timeout policy. [`SimulatedBackend`] is a deterministic stand-in
//! used when no hardware backend is wired in.

pub mod backend;
pub mod coordinator;
pub mod simulated;

pub use backend::{BackendError, BackendOutcome, EmulatorBackend, RunStatus, ScriptedBackend};
pub use coordinator::{ExecutionConfig, ExecutionOutcome, RetryPolicy, TestExecutionCoordinator};
pub use simulated::{SimulatedBackend, SimulationConfig};
