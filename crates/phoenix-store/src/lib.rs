//! Durable stores shared by sessions and workflows.
//!
//! - [`LogBuffer`]: append-only, per-session ordered log streams with
//!   offset-based incremental reads.
//! - [`Registry`]: emulators, generated tests, sessions and reports, with
//!   idempotent upserts and creation-ordered listings.
//!
//! Both run purely in memory or persist under a data directory so that a
//! completed report and a session's full log history survive a restart.

pub mod error;
pub mod log_buffer;
mod persist;
pub mod registry;

pub use error::{StoreError, StoreResult};
pub use log_buffer::LogBuffer;
pub use registry::Registry;
