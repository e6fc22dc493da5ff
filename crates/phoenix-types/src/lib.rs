//! Shared data model for the Phoenix board-verification engine.
//!
//! Every other crate in the workspace speaks in these types: emulators,
//! verification sessions, log entries, generated test cases, test results
//! and reports, plus the error taxonomy surfaced to callers.

pub mod error;
pub mod firmware;
pub mod types;

pub use error::{EntityKind, VerifyError, VerifyResult};
pub use firmware::{Firmware, FirmwareInfo};
pub use types::*;
