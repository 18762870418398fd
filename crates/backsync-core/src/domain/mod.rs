//! Domain entities and business rules
//!
//! This module contains the core domain types for backsync:
//! - Newtypes for type-safe identifiers
//! - The backup job entity and its watch mode
//! - Domain-specific error types

pub mod backup_job;
pub mod errors;
pub mod newtypes;

// Re-export commonly used types
pub use backup_job::{BackupJob, WatchMode, LIST_SEPARATOR};
pub use errors::DomainError;
pub use newtypes::*;
