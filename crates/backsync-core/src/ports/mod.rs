//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IPathResolver`] - Maps a virtual destination path to a storage backend
//! - [`IUploader`] - Puts a local file into a resolved storage backend
//! - [`IRecordStore`] - Persistent storage for jobs and per-file timestamps

pub mod path_resolver;
pub mod record_store;
pub mod uploader;

pub use path_resolver::{IPathResolver, ResolveError, ResolvedTarget, StorageHandle};
pub use record_store::IRecordStore;
pub use uploader::{FileStream, IUploader, ProgressFn};
