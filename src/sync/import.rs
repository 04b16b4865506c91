//! Snapshot and direct-store import.
//!
//! Every import runs in one IMMEDIATE transaction: channels, messages,
//! coordinates, sessions and recommendations are merged, and the statistics
//! of every channel that received message changes are recomputed before the
//! commit. A dry run executes exactly the same statements inside a
//! transaction that is always rolled back, so its [`ImportStats`] match what
//! a real run would report.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::db::{admin, channels, messages, recommendations, sessions, Database};
use crate::error::{Error, Result};
use crate::merge::{merge_field, CHANNEL_SYNC_RULES, MESSAGE_UPDATE_RULES, RECORD_IMPORT_RULE};
use crate::metrics;
use crate::models::{
    same_point, CoordinateFormat, ImportHistoryEntry, MediaKind, NewCoordinate, Recommendation, StoredMessage,
};
use crate::sync::export::export_snapshot;
use crate::sync::snapshot::{MessageRow, RecommendationRow, Snapshot};
use crate::sync::strategy::MergeStrategy;

/// Counters reported by an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    /// Messages new to this store
    pub messages_imported: usize,
    /// Stored messages the strategy let the incoming row overwrite
    pub messages_updated: usize,
    /// Stored messages kept as they were
    pub messages_skipped: usize,
    /// Coordinates appended
    pub coordinates_imported: usize,
    /// Coordinates already present within tolerance, or without a message
    pub coordinates_skipped: usize,
    /// Channels new to this store
    pub channels_added: usize,
    /// Stored channels merged with incoming fields
    pub channels_updated: usize,
    /// Recommendations merged
    pub recommendations_merged: usize,
    /// Sessions merged
    pub sessions_merged: usize,
    /// Incoming messages whose identity already existed
    pub conflicts_resolved: usize,
    /// Rows that could not be interpreted
    pub malformed_rows: usize,
}

/// Where an import reads from, decided by the file suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportSource {
    /// `.json` or `.gz` snapshot document
    Snapshot,
    /// `.db`, `.sqlite` or `.sqlite3` store file
    Store,
}

impl ImportSource {
    /// Classify `path`; any other suffix is a validation error
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "json" | "gz" => Ok(Self::Snapshot),
            "db" | "sqlite" | "sqlite3" => Ok(Self::Store),
            _ => Err(Error::Validation(format!(
                "Unsupported import file type: {} (expected .json, .gz, .db, .sqlite or .sqlite3)",
                path.display()
            ))),
        }
    }

    /// Label recorded in the import history
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Store => "store",
        }
    }
}

/// How an import behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Message conflict policy
    pub strategy: MergeStrategy,
    /// Roll everything back and write nothing, not even history
    pub dry_run: bool,
    /// Back up the store before a real import
    pub backup: bool,
    /// Directory for that backup; next to the store when `None`
    pub backup_dir: Option<PathBuf>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Smart,
            dry_run: false,
            backup: true,
            backup_dir: None,
        }
    }
}

impl ImportOptions {
    /// Options from the `sync` configuration section
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            strategy: config.default_strategy.parse()?,
            dry_run: false,
            backup: config.backup_before_import,
            backup_dir: config.backup_dir.as_ref().map(PathBuf::from),
        })
    }
}

/// Applies snapshots and foreign stores to a local store
pub struct Importer {
    db: Database,
    options: ImportOptions,
}

impl Importer {
    /// Importer writing into `db`
    #[must_use]
    pub const fn new(db: Database, options: ImportOptions) -> Self {
        Self { db, options }
    }

    /// Import whatever `path` holds, chosen by its suffix.
    ///
    /// Unsupported suffixes and unreadable or invalid files are rejected
    /// before any write. Failures of real imports are still written to the
    /// import history.
    pub fn import_path(&self, path: &Path) -> Result<ImportStats> {
        let source = ImportSource::from_path(path)?;
        let loaded = match source {
            ImportSource::Snapshot => Snapshot::read_from(path),
            ImportSource::Store => self.read_store(path),
        };
        match loaded {
            Ok(snapshot) => self.import_snapshot(&snapshot, path, source),
            Err(err) => {
                error!(path = %path.display(), error = %err, "Import rejected");
                self.record_failure(path, None, source, &err);
                metrics::record_import(
                    self.options.strategy.as_str(),
                    "failed",
                    self.options.dry_run,
                    Duration::ZERO,
                );
                Err(err)
            }
        }
    }

    /// Read a foreign store through a read-only handle
    fn read_store(&self, path: &Path) -> Result<Snapshot> {
        if let (Ok(foreign), Ok(local)) = (path.canonicalize(), self.db.path().canonicalize()) {
            if foreign == local {
                return Err(Error::Validation("Cannot import a store into itself".into()));
            }
        }
        let foreign = Database::open_read_only(path)?;
        let conn = foreign.get_connection()?;
        export_snapshot(&conn, None)
    }

    /// Merge an in-memory snapshot; `origin` is recorded in the history
    pub fn import_snapshot(&self, snapshot: &Snapshot, origin: &Path, source: ImportSource) -> Result<ImportStats> {
        let started = Instant::now();
        let strategy = self.options.strategy;
        info!(
            origin = %origin.display(),
            source = source.as_str(),
            %strategy,
            dry_run = self.options.dry_run,
            device = ?snapshot.device_id,
            messages = snapshot.messages.len(),
            "Import started"
        );

        if self.options.dry_run {
            let stats = self.db.with_rollback(|tx| apply_snapshot(tx, snapshot, strategy))?;
            info!(?stats, "Dry run finished; store unchanged");
            metrics::record_import(strategy.as_str(), "dry_run", true, started.elapsed());
            return Ok(stats);
        }

        if self.options.backup {
            let backup = self.db.backup_timestamped(self.options.backup_dir.as_deref())?;
            info!(backup = %backup.display(), "Store backed up before import");
        }

        let outcome = self.db.with_transaction(|tx| {
            let stats = apply_snapshot(tx, snapshot, strategy)?;
            admin::log_import(
                tx,
                &history_entry(origin, snapshot.device_id.clone(), source, strategy, &stats, None),
            )?;
            Ok(stats)
        });

        match outcome {
            Ok(stats) => {
                info!(?stats, elapsed_ms = started.elapsed().as_millis(), "Import committed");
                metrics::record_import(strategy.as_str(), "completed", false, started.elapsed());
                Ok(stats)
            }
            Err(err) => {
                error!(error = %err, "Import failed and was rolled back");
                self.record_failure(origin, snapshot.device_id.clone(), source, &err);
                metrics::record_import(strategy.as_str(), "failed", false, started.elapsed());
                Err(err)
            }
        }
    }

    fn record_failure(&self, origin: &Path, device: Option<String>, source: ImportSource, err: &Error) {
        if self.options.dry_run {
            return;
        }
        let entry = history_entry(
            origin,
            device,
            source,
            self.options.strategy,
            &ImportStats::default(),
            Some(err.to_string()),
        );
        if let Err(log_err) = self.db.log_import(&entry) {
            warn!(error = %log_err, "Could not record failed import");
        }
    }
}

/// Import `path` into `db` with default backup behaviour
pub fn import_path(db: &Database, path: &Path, strategy: MergeStrategy, dry_run: bool) -> Result<ImportStats> {
    let options = ImportOptions {
        strategy,
        dry_run,
        ..ImportOptions::default()
    };
    Importer::new(db.clone(), options).import_path(path)
}

fn history_entry(
    origin: &Path,
    device: Option<String>,
    source: ImportSource,
    strategy: MergeStrategy,
    stats: &ImportStats,
    error: Option<String>,
) -> ImportHistoryEntry {
    ImportHistoryEntry {
        source_file: origin.display().to_string(),
        source_device: device,
        import_type: source.as_str().to_string(),
        strategy: strategy.as_str().to_string(),
        stats: serde_json::to_value(stats).unwrap_or(serde_json::Value::Null),
        status: if error.is_some() { "failed" } else { "completed" }.to_string(),
        error,
    }
}

/// Merge `snapshot` into the store behind `conn` under `strategy`.
///
/// The caller owns the transaction.
pub fn apply_snapshot(conn: &Connection, snapshot: &Snapshot, strategy: MergeStrategy) -> Result<ImportStats> {
    let mut stats = ImportStats {
        malformed_rows: snapshot.malformed_rows,
        ..ImportStats::default()
    };

    for row in &snapshot.channels {
        if channels::upsert_channel(conn, row.id, &row.to_fields(), &CHANNEL_SYNC_RULES)? {
            stats.channels_added += 1;
        } else {
            stats.channels_updated += 1;
        }
    }

    let (mut refs, touched) = import_messages(conn, &snapshot.messages, strategy, &mut stats)?;
    import_coordinates(conn, snapshot, &mut refs, &mut stats)?;

    for row in &snapshot.sessions {
        let session = match row.to_session(snapshot.device_id.as_deref()) {
            Ok(session) => session,
            Err(err) => {
                debug!(error = %err, "Skipping session");
                stats.malformed_rows += 1;
                continue;
            }
        };
        if session.session_end.is_some_and(|end| end < session.session_start) {
            debug!(start = %session.session_start, "Skipping session that ends before it starts");
            stats.malformed_rows += 1;
            continue;
        }
        sessions::merge_session(conn, &session)?;
        stats.sessions_merged += 1;
    }

    for row in &snapshot.recommendations {
        let existing = recommendations::get_recommendation(conn, row.channel_id)?;
        let merged = merge_recommendation(existing, row);
        recommendations::save_recommendation(conn, &merged)?;
        stats.recommendations_merged += 1;
    }

    for channel_id in touched {
        channels::recompute_channel_statistics(conn, channel_id)?;
    }
    Ok(stats)
}

type MessageRefs = HashMap<(i64, i64), i64>;

fn import_messages(
    conn: &Connection,
    rows: &[MessageRow],
    strategy: MergeStrategy,
    stats: &mut ImportStats,
) -> Result<(MessageRefs, BTreeSet<i64>)> {
    // Group by channel; a repeated identity keeps its last row
    let mut by_channel: BTreeMap<i64, BTreeMap<i64, &MessageRow>> = BTreeMap::new();
    for row in rows {
        by_channel
            .entry(row.channel_id)
            .or_default()
            .insert(row.message_id, row);
    }

    let mut refs = MessageRefs::new();
    let mut touched = BTreeSet::new();
    for (channel_id, channel_rows) in by_channel {
        if channels::ensure_channel(conn, channel_id)? {
            stats.channels_added += 1;
        }
        let ids: Vec<i64> = channel_rows.keys().copied().collect();
        let existing = messages::messages_by_id(conn, channel_id, &ids)?;

        for (message_id, row) in channel_rows {
            let Some(current) = existing.get(&message_id) else {
                let id = messages::insert_message_row(conn, &row.to_stored())?;
                refs.insert((channel_id, message_id), id);
                stats.messages_imported += 1;
                touched.insert(channel_id);
                continue;
            };

            stats.conflicts_resolved += 1;
            refs.insert((channel_id, message_id), current.id);
            if strategy.should_update_stamp(current.last_updated, row.last_updated_stamp()) {
                let merged = merge_message(current, row);
                if merged != *current {
                    messages::update_message_row(conn, &merged)?;
                    touched.insert(channel_id);
                }
                stats.messages_updated += 1;
            } else {
                stats.messages_skipped += 1;
            }
        }
    }
    Ok((refs, touched))
}

/// Apply [`MESSAGE_UPDATE_RULES`] to a stored message the strategy let the
/// incoming row win against. The surrogate id never changes.
fn merge_message(current: &StoredMessage, row: &MessageRow) -> StoredMessage {
    let incoming = row.to_stored();
    let rules = MESSAGE_UPDATE_RULES;
    StoredMessage {
        id: current.id,
        channel_id: current.channel_id,
        message_id: current.message_id,
        // Empty text is a value; only a missing field keeps the stored text
        text: row.message_text.clone().unwrap_or_else(|| current.text.clone()),
        date: merge_field(rules.content, current.date, incoming.date),
        media_type: merge_field(
            rules.content,
            Some(current.media_type.as_str().to_string()),
            row.media_type.clone(),
        )
        .map_or(current.media_type, |m| MediaKind::from_stored(&m)),
        has_coordinates: merge_field(rules.content, Some(current.has_coordinates), row.has_coordinates)
            .unwrap_or(current.has_coordinates),
        processed_at: merge_field(rules.processed_at, current.processed_at, incoming.processed_at),
        last_updated: merge_field(rules.last_updated, current.last_updated, incoming.last_updated)
            .or_else(|| Some(Utc::now())),
    }
}

fn import_coordinates(
    conn: &Connection,
    snapshot: &Snapshot,
    refs: &mut MessageRefs,
    stats: &mut ImportStats,
) -> Result<()> {
    // Coordinates of messages that were not part of this snapshot
    let mut missing: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for row in &snapshot.coordinates {
        if !refs.contains_key(&(row.channel_id, row.message_id)) {
            missing.entry(row.channel_id).or_default().insert(row.message_id);
        }
    }
    for (channel_id, ids) in missing {
        let ids: Vec<i64> = ids.into_iter().collect();
        for (message_id, id) in messages::existing_message_refs(conn, channel_id, &ids)? {
            refs.insert((channel_id, message_id), id);
        }
    }

    let targets: Vec<i64> = snapshot
        .coordinates
        .iter()
        .filter_map(|row| refs.get(&(row.channel_id, row.message_id)).copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut known = messages::coordinate_points(conn, &targets)?;

    let mut new_rows = Vec::new();
    for row in &snapshot.coordinates {
        let point = (row.latitude, row.longitude);
        if !point.0.is_finite() || !point.1.is_finite() || point.0.abs() > 90.0 || point.1.abs() > 180.0 {
            debug!(lat = point.0, lon = point.1, "Skipping out-of-range coordinate");
            stats.malformed_rows += 1;
            continue;
        }
        let Some(&message_ref) = refs.get(&(row.channel_id, row.message_id)) else {
            debug!(
                channel_id = row.channel_id,
                message_id = row.message_id,
                "Skipping coordinate without a message"
            );
            stats.coordinates_skipped += 1;
            continue;
        };
        let points = known.entry(message_ref).or_default();
        if points.iter().any(|&p| same_point(p, point)) {
            stats.coordinates_skipped += 1;
            continue;
        }
        points.push(point);
        new_rows.push(NewCoordinate {
            message_ref,
            latitude: point.0,
            longitude: point.1,
            format: row
                .coordinate_format
                .as_deref()
                .map_or(CoordinateFormat::Decimal, CoordinateFormat::from_stored),
            confidence: row.extraction_confidence.clone(),
        });
    }
    stats.coordinates_imported += messages::bulk_insert_coordinates(conn, &new_rows)?;
    Ok(())
}

/// Field-wise merge of an incoming recommendation; the forward graph of
/// both sides is kept.
fn merge_recommendation(existing: Option<Recommendation>, row: &RecommendationRow) -> Recommendation {
    let incoming = row.to_recommendation();
    let Some(current) = existing else {
        return incoming;
    };
    let rule = RECORD_IMPORT_RULE;
    let mut discovered_from = current.discovered_from.clone();
    for channel in &incoming.discovered_from {
        if !discovered_from.contains(channel) {
            discovered_from.push(*channel);
        }
    }
    Recommendation {
        channel_id: current.channel_id,
        username: merge_field(rule, current.username, incoming.username),
        title: merge_field(rule, current.title, incoming.title),
        channel_type: merge_field(rule, current.channel_type, incoming.channel_type),
        first_seen: merge_field(rule, current.first_seen, incoming.first_seen),
        last_seen: merge_field(rule, current.last_seen, incoming.last_seen),
        discovered_from,
        forward_count: merge_field(rule, Some(current.forward_count), row.forward_count)
            .unwrap_or(current.forward_count),
        coordinate_forward_count: merge_field(
            rule,
            Some(current.coordinate_forward_count),
            row.coordinate_forward_count,
        )
        .unwrap_or(current.coordinate_forward_count),
        recommendation_score: merge_field(rule, Some(current.recommendation_score), row.recommendation_score)
            .unwrap_or(current.recommendation_score),
        user_status: merge_field(rule, Some(current.user_status), row.user_status.clone())
            .unwrap_or_else(|| "pending".to_string()),
        user_notes: merge_field(rule, current.user_notes, incoming.user_notes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_chosen_by_suffix() {
        assert_eq!(ImportSource::from_path(Path::new("a.json")).unwrap(), ImportSource::Snapshot);
        assert_eq!(ImportSource::from_path(Path::new("a.json.GZ")).unwrap(), ImportSource::Snapshot);
        assert_eq!(ImportSource::from_path(Path::new("b.sqlite3")).unwrap(), ImportSource::Store);
        assert!(matches!(
            ImportSource::from_path(Path::new("c.csv")),
            Err(Error::Validation(_))
        ));
        assert!(ImportSource::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn recommendation_merge_keeps_both_forward_graphs() {
        let current = Recommendation {
            channel_id: 9,
            username: Some("kept".into()),
            title: Some("Old".into()),
            channel_type: Some("channel".into()),
            first_seen: None,
            last_seen: None,
            discovered_from: vec![1, 2],
            forward_count: 4,
            coordinate_forward_count: 1,
            recommendation_score: 0.5,
            user_status: "approved".into(),
            user_notes: Some("mine".into()),
        };
        let row = RecommendationRow {
            channel_id: 9,
            username: None,
            title: Some("New".into()),
            channel_type: None,
            first_seen: None,
            last_seen: None,
            discovered_from_channels: vec![2, 3],
            forward_count: Some(6),
            coordinate_forward_count: None,
            recommendation_score: None,
            user_status: None,
            user_notes: None,
        };
        let merged = merge_recommendation(Some(current), &row);
        assert_eq!(merged.username.as_deref(), Some("kept"));
        assert_eq!(merged.title.as_deref(), Some("New"));
        assert_eq!(merged.discovered_from, vec![1, 2, 3]);
        assert_eq!(merged.forward_count, 6);
        assert_eq!(merged.coordinate_forward_count, 1);
        assert_eq!(merged.user_status, "approved");
        assert_eq!(merged.user_notes.as_deref(), Some("mine"));
    }
}
