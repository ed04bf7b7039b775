//! Local-first hazard report queue with online sync.
//!
//! Reports are persisted by [`store::ReportStore`] the moment they are
//! submitted and drained to the remote reports endpoint by
//! [`sync::SyncEngine`] whenever connectivity allows.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod remote;
pub mod report;
pub mod service;
pub mod store;
pub mod submission;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SyncConfig;
pub use error::{ReportError, Result};
pub use report::{IncidentType, Location, Report, ReportDraft, Severity, SyncState};
