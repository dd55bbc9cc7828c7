//! # Roster Common Library
//!
//! Shared code for the roster services including:
//! - Database initialization and row models
//! - Event types (RosterEvent enum) and the in-process EventBus
//! - Configuration loading and root folder resolution
//! - Common error type

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{EventBus, RosterEvent};

/// Opaque identity of the user performing an operation
///
/// Supplied by the calling layer; no authentication happens in this workspace.
pub type ActorId = i64;
