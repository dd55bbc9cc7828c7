//! roster-import: school-records bulk import and reconciliation
//!
//! Data flows strictly one way:
//!
//! - [`decoder`]: spreadsheet bytes into candidate records
//! - [`planner`]: candidate records plus persisted state into a plan
//! - [`committer`]: the plan applied atomically, classes before students
//!
//! [`service::ImportService`] drives a batch through those stages and hands
//! the outcome to an [`audit::AuditSink`] after the transaction closed.

pub mod audit;
pub mod committer;
pub mod decoder;
pub mod error;
pub mod planner;
pub mod service;
pub mod store;

pub use crate::error::ImportError;
pub use crate::service::{BatchResult, GroupImportResult, ImportService, StudentInput};
pub use crate::store::RosterStore;
