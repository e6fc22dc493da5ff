//! Phoenix verification platform.
//!
//! Sessions verify a firmware image against a registered emulator; workflows
//! run the whole pipeline from specification documents to a stored report.
//! [`engine::Platform`] wires everything together and [`api::handle_request`]
//! exposes it over JSON-RPC.

pub mod api;
pub mod config;
pub mod engine;
pub mod generate;
pub mod parser;
pub mod pipeline;
pub mod session;
pub mod status;

pub use engine::{Platform, PlatformStatus};
pub use pipeline::{PipelineOrchestrator, WorkflowRequest, WorkflowSummary};
pub use session::{LogPage, SessionManager};
