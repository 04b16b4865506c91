//! Channel Coords - Coordinate Scraping and Store Sync
//!
//! A Rust library that ingests channel message histories, extracts
//! geographic coordinates into a local SQLite store and keeps stores on
//! several devices in step.
//!
//! # Features
//!
//! - Batched, resumable ingestion from any [`source::MessageSource`]
//! - Decimal and DMS coordinate extraction with range validation
//! - Snapshot export (full or incremental, optionally gzip-compressed)
//! - Snapshot and direct-store import under a [`MergeStrategy`]
//! - Channel recommendations from forwarded messages
//! - CSV export of every extracted coordinate

/// Configuration management
pub mod config;
/// Database operations and connection pooling
pub mod db;
/// Error types
pub mod error;
/// Coordinate extraction
pub mod extract;
/// Coordinates CSV export
pub mod file_writer;
/// Ingestion pipeline
pub mod ingest;
/// Link extraction and categorisation
pub mod links;
/// Logging setup and utilities
pub mod logging;
/// Field-level merge rules
pub mod merge;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Channel recommendations from forwards
pub mod recommend;
/// Retry with back-off and cancellation
pub mod retry;
/// Database schema definitions
pub mod schema;
/// Message sources
pub mod source;
/// Snapshot export, import and merge
pub mod sync;
/// Timestamp and SQL helpers
pub mod utils;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use config::AppConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use extract::{CoordinateExtractor, RegexExtractor};
pub use ingest::{IngestOptions, IngestPipeline, RunReport};
pub use retry::Cancellation;
pub use source::{JsonExportSource, MessageSource};
pub use sync::{ImportOptions, ImportStats, Importer, MergeStrategy, Snapshot};
