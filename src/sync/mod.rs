//! Cross-device synchronization: snapshot export, import and merge.
//!
//! [`export`] writes the store (or everything changed after a watermark) to
//! a [`Snapshot`]. [`import`] merges a snapshot, or a foreign store read
//! through a read-only handle, back into the local store under a
//! [`MergeStrategy`]. Both paths share the per-entity rules in
//! [`crate::merge`].

pub mod export;
pub mod import;
pub mod snapshot;
pub mod strategy;

pub use export::{export_snapshot, export_to_file, ExportSummary};
pub use import::{apply_snapshot, import_path, ImportOptions, ImportSource, ImportStats, Importer};
pub use snapshot::Snapshot;
pub use strategy::{IncomingStamp, MergeStrategy};
