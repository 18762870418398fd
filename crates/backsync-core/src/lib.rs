//! backsync Core - Domain types, configuration and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `BackupJob`, `WatchMode`, `JobId`
//! - **Configuration** - `Config` loaded from YAML, with validation and a builder
//! - **Port definitions** - Traits for adapters: `IPathResolver`, `IUploader`, `IRecordStore`
//!
//! # Architecture
//!
//! The domain module holds plain data and validation rules with no I/O.
//! Ports define the trait interfaces that the sync engine depends on and
//! that adapter crates (SQLite store, storage backends) implement.

pub mod config;
pub mod domain;
pub mod ports;
