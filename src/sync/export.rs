//! Snapshot export, full or incremental.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::info;

use crate::db::{self, channels, messages::map_message, recommendations, sessions, Database};
use crate::error::Result;
use crate::logging::OperationTimer;
use crate::metrics;
use crate::schema::{self, coordinates, messages};
use crate::sync::snapshot::{ChannelRow, CoordinateRow, MessageRow, RecommendationRow, SessionRow, Snapshot};
use crate::utils::format_timestamp;

/// What an export wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    /// File written (with `.gz` when compressed)
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// Channels written
    pub channel_count: usize,
    /// Messages written
    pub message_count: usize,
    /// Coordinates written
    pub coordinate_count: usize,
    /// Sync sessions written
    pub session_count: usize,
    /// Recommendations written
    pub recommendation_count: usize,
    /// Whether the file is gzip-compressed
    pub compressed: bool,
    /// Watermark of an incremental export
    pub since: Option<DateTime<Utc>>,
}

/// Earliest id, latest id and row count per channel
fn message_ranges(conn: &Connection) -> Result<HashMap<i64, (i64, i64, i64)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ch}, MIN({mid}), MAX({mid}), COUNT(*) FROM {t} GROUP BY {ch}",
        ch = messages::CHANNEL_ID,
        mid = messages::MESSAGE_ID,
        t = messages::TABLE,
    ))?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, (row.get(1)?, row.get(2)?, row.get(3)?))))?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

fn export_messages(conn: &Connection, since: Option<&str>) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {cols} FROM {t} WHERE ?1 IS NULL OR {lu} > ?1 ORDER BY {ch}, {mid}",
        cols = messages::SELECT_COLUMNS,
        t = messages::TABLE,
        lu = messages::LAST_UPDATED,
        ch = messages::CHANNEL_ID,
        mid = messages::MESSAGE_ID,
    ))?;
    let rows = stmt.query_map(params![since], map_message)?;
    let mut exported = Vec::new();
    for row in rows {
        exported.push(MessageRow::from(&row?));
    }
    Ok(exported)
}

fn export_coordinates(conn: &Connection, since: Option<&str>) -> Result<Vec<CoordinateRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT m.{ch}, m.{mid}, c.{lat}, c.{lon}, c.{fmt}, c.{conf}, c.{created}
         FROM {ct} c JOIN {mt} m ON m.{id} = c.{mref}
         WHERE ?1 IS NULL OR m.{lu} > ?1 OR c.{created} > ?1
         ORDER BY m.{ch}, m.{mid}, c.{cid}",
        ch = messages::CHANNEL_ID,
        mid = messages::MESSAGE_ID,
        lu = messages::LAST_UPDATED,
        id = messages::ID,
        mt = messages::TABLE,
        ct = coordinates::TABLE,
        cid = coordinates::ID,
        mref = coordinates::MESSAGE_REF,
        lat = coordinates::LATITUDE,
        lon = coordinates::LONGITUDE,
        fmt = coordinates::COORDINATE_FORMAT,
        conf = coordinates::EXTRACTION_CONFIDENCE,
        created = coordinates::CREATED_AT,
    ))?;
    let rows = stmt.query_map(params![since], |row| {
        Ok(CoordinateRow {
            channel_id: row.get(0)?,
            message_id: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            coordinate_format: row.get(4)?,
            extraction_confidence: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Build a snapshot of everything mutated after `since` (everything when
/// `None`).
///
/// Messages are selected by `last_updated`. Coordinates follow their
/// message, or their own creation time. Channels are included when they
/// changed or when an exported message belongs to them. Recommendations
/// follow `last_seen` and sessions their start or end. Nothing is written,
/// so this also works on a read-only store. Optional tables missing from an
/// older store are exported as empty collections.
pub fn export_snapshot(conn: &Connection, since: Option<&DateTime<Utc>>) -> Result<Snapshot> {
    let watermark = since.map(format_timestamp);
    let watermark = watermark.as_deref();

    let mut snapshot = if db::table_exists(conn, schema::metadata::TABLE)? {
        Snapshot::new(
            db::get_metadata(conn, schema::metadata::DEVICE_ID_KEY)?,
            db::schema_version(conn)?,
        )
    } else {
        Snapshot::new(None, None)
    };
    snapshot.messages = export_messages(conn, watermark)?;
    snapshot.coordinates = export_coordinates(conn, watermark)?;

    let referenced: HashSet<i64> = snapshot
        .messages
        .iter()
        .map(|m| m.channel_id)
        .chain(snapshot.coordinates.iter().map(|c| c.channel_id))
        .collect();
    let ranges = message_ranges(conn)?;
    snapshot.channels = channels::list_channels(conn)?
        .iter()
        .filter(|c| {
            since.is_none()
                || referenced.contains(&c.id)
                || c.last_updated.zip(since).is_some_and(|(updated, since)| updated > *since)
        })
        .map(|c| ChannelRow::from_channel(c, ranges.get(&c.id).copied()))
        .collect();

    if db::table_exists(conn, schema::sync_sessions::TABLE)? {
        snapshot.sessions = sessions::sessions_since(conn, watermark)?
            .iter()
            .map(SessionRow::from)
            .collect();
    }
    if db::table_exists(conn, schema::recommended_channels::TABLE)? {
        snapshot.recommendations = recommendations::list_recommendations(conn)?
            .iter()
            .filter(|r| since.is_none() || r.last_seen.zip(since).is_some_and(|(seen, since)| seen > *since))
            .map(RecommendationRow::from)
            .collect();
    }
    Ok(snapshot)
}

/// Export the store to `path`; see [`Snapshot::write_to`] for `compress`.
pub fn export_to_file(
    db: &Database,
    path: &Path,
    since: Option<DateTime<Utc>>,
    compress: bool,
) -> Result<ExportSummary> {
    let timer = OperationTimer::new("export");
    // Make sure this installation has an id before it is written out
    db.device_id()?;
    let snapshot = export_snapshot(&*db.get_connection()?, since.as_ref())?;
    let written = snapshot.write_to(path, compress)?;

    let summary = ExportSummary {
        size_bytes: std::fs::metadata(&written)?.len(),
        compressed: crate::sync::snapshot::is_compressed_path(&written),
        path: written,
        channel_count: snapshot.channels.len(),
        message_count: snapshot.messages.len(),
        coordinate_count: snapshot.coordinates.len(),
        session_count: snapshot.sessions.len(),
        recommendation_count: snapshot.recommendations.len(),
        since,
    };
    metrics::record_export(summary.message_count);
    info!(
        path = %summary.path.display(),
        messages = summary.message_count,
        channels = summary.channel_count,
        coordinates = summary.coordinate_count,
        bytes = summary.size_bytes,
        incremental = since.is_some(),
        "Snapshot exported"
    );
    timer.finish();
    Ok(summary)
}
