//! CSV export of extracted coordinates.
//!
//! One row per stored coordinate, joined with its message and channel, so the
//! file can be loaded straight into a GIS tool or spreadsheet.

use crate::db::Database;
use crate::error::Result;
use crate::schema::{channels, coordinates, messages};
use csv::Writer;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fs::{create_dir_all, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

/// One line of the coordinates CSV
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinateCsvRow {
    pub channel_id: i64,
    pub channel_title: String,
    pub message_id: i64,
    pub message_date: String,
    pub latitude: f64,
    pub longitude: f64,
    pub coordinate_format: String,
    pub extraction_confidence: String,
    pub message_text: String,
    pub message_link: String,
}

/// Public link to a message: `t.me/<username>/<id>` for public channels,
/// `t.me/c/<channel>/<id>` otherwise.
#[must_use]
pub fn message_link(channel_id: i64, username: Option<&str>, message_id: i64) -> String {
    match username.filter(|u| !u.is_empty()) {
        Some(username) => format!("https://t.me/{username}/{message_id}"),
        None => format!("https://t.me/c/{channel_id}/{message_id}"),
    }
}

/// Read the coordinate rows, optionally limited to one channel, ordered by
/// channel, message and insertion order.
pub fn coordinate_rows(conn: &Connection, channel: Option<i64>) -> Result<Vec<CoordinateCsvRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT m.{ch}, ch.{title}, ch.{username}, m.{mid}, m.{date}, c.{lat}, c.{lon},
                c.{fmt}, c.{conf}, m.{text}
         FROM {ct} c
         JOIN {mt} m ON m.{id} = c.{mref}
         LEFT JOIN {cht} ch ON ch.{chid} = m.{ch}
         WHERE ?1 IS NULL OR m.{ch} = ?1
         ORDER BY m.{ch}, m.{mid}, c.{cid}",
        ch = messages::CHANNEL_ID,
        mid = messages::MESSAGE_ID,
        date = messages::MESSAGE_DATE,
        text = messages::MESSAGE_TEXT,
        id = messages::ID,
        mt = messages::TABLE,
        title = channels::TITLE,
        username = channels::USERNAME,
        cht = channels::TABLE,
        chid = channels::ID,
        ct = coordinates::TABLE,
        cid = coordinates::ID,
        mref = coordinates::MESSAGE_REF,
        lat = coordinates::LATITUDE,
        lon = coordinates::LONGITUDE,
        fmt = coordinates::COORDINATE_FORMAT,
        conf = coordinates::EXTRACTION_CONFIDENCE,
    ))?;

    let rows = stmt.query_map(params![channel], |row| {
        let channel_id: i64 = row.get(0)?;
        let username: Option<String> = row.get(2)?;
        let message_id: i64 = row.get(3)?;
        Ok(CoordinateCsvRow {
            channel_id,
            channel_title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            message_id,
            message_date: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            coordinate_format: row.get(7)?,
            extraction_confidence: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            message_text: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            message_link: message_link(channel_id, username.as_deref(), message_id),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Write coordinate rows to a CSV file with a header line.
///
/// # Errors
///
/// Returns an error if file creation or writing fails.
pub fn write_coordinates_csv(rows: &[CoordinateCsvRow], file_path: &Path) -> Result<()> {
    if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir_all(parent)?;
    }
    let file = File::create(file_path)?;
    let mut writer = Writer::from_writer(BufWriter::new(file));

    for row in rows {
        writer.serialize(row)?;
    }
    // serialize() only emits the header with the first row
    if rows.is_empty() {
        writer.write_record([
            "channel_id",
            "channel_title",
            "message_id",
            "message_date",
            "latitude",
            "longitude",
            "coordinate_format",
            "extraction_confidence",
            "message_text",
            "message_link",
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Export every stored coordinate (or one channel's) to `file_path`.
///
/// Returns the number of rows written.
pub fn export_coordinates_csv(db: &Database, file_path: &Path, channel: Option<i64>) -> Result<usize> {
    let rows = coordinate_rows(&*db.get_connection()?, channel)?;
    write_coordinates_csv(&rows, file_path)?;
    info!(path = %file_path.display(), rows = rows.len(), ?channel, "Coordinates CSV written");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_prefer_username() {
        assert_eq!(message_link(1001, Some("mapdrops"), 11), "https://t.me/mapdrops/11");
        assert_eq!(message_link(1001, None, 11), "https://t.me/c/1001/11");
        assert_eq!(message_link(1001, Some(""), 11), "https://t.me/c/1001/11");
    }

    #[test]
    fn empty_export_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/coords.csv");
        write_coordinates_csv(&[], &path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("channel_id,channel_title,message_id"));
        assert_eq!(content.lines().count(), 1);
    }
}
