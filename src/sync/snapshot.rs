//! Portable snapshot document.
//!
//! A snapshot is one JSON object, optionally gzip-compressed (chosen by a
//! `.gz` suffix), with the header fields `version`, `export_date`,
//! `device_id` and `schema_version` and the row collections `channels`,
//! `messages`, `coordinates`, `sessions` and `recommendations`. The first two
//! collections are required.
//!
//! Reading is lenient so snapshots written by older exporters still load:
//! booleans may be 0/1, id lists may be JSON text, and a row that cannot be
//! interpreted is skipped and counted instead of failing the whole file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{
    Channel, ChannelFields, ChannelType, MediaKind, Recommendation, SessionStatus, StoredMessage, SyncSession,
};
use crate::sync::strategy::IncomingStamp;
use crate::utils::{format_timestamp, parse_timestamp};

/// Format version written by this exporter
pub const SNAPSHOT_VERSION: &str = "2.0";

/// Collections every snapshot must carry
pub const REQUIRED_SECTIONS: [&str; 2] = ["channels", "messages"];

/// Whether `path` names a compressed snapshot
#[must_use]
pub fn is_compressed_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(flag)) => Some(flag),
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn id_list<'de, D>(deserializer: D) -> std::result::Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        Some(Value::String(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
        _ => Vec::new(),
    })
}

fn timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(parse_timestamp)
}

/// Channel row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: i64,
    pub username: Option<String>,
    pub title: Option<String>,
    pub channel_type: Option<String>,
    pub first_scraped: Option<String>,
    pub last_scraped: Option<String>,
    pub total_messages: Option<i64>,
    pub messages_with_coordinates: Option<i64>,
    pub coordinate_density: Option<f64>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_active: Option<bool>,
    pub notes: Option<String>,
    pub last_updated: Option<String>,
    /// Informational: highest message id held by the exporter
    pub latest_message_id: Option<i64>,
    /// Informational: lowest message id held by the exporter
    pub earliest_message_id: Option<i64>,
    /// Informational: message rows held by the exporter
    pub actual_message_count: Option<i64>,
}

impl ChannelRow {
    /// Row for a stored channel plus its message-id range and count
    #[must_use]
    pub fn from_channel(channel: &Channel, range: Option<(i64, i64, i64)>) -> Self {
        Self {
            id: channel.id,
            username: channel.username.clone(),
            title: channel.title.clone(),
            channel_type: channel.channel_type.map(|t| t.as_str().to_string()),
            first_scraped: channel.first_scraped.as_ref().map(format_timestamp),
            last_scraped: channel.last_scraped.as_ref().map(format_timestamp),
            total_messages: Some(channel.total_messages),
            messages_with_coordinates: Some(channel.messages_with_coordinates),
            coordinate_density: Some(channel.coordinate_density),
            is_active: Some(channel.is_active),
            notes: channel.notes.clone(),
            last_updated: channel.last_updated.as_ref().map(format_timestamp),
            earliest_message_id: range.map(|(earliest, _, _)| earliest),
            latest_message_id: range.map(|(_, latest, _)| latest),
            actual_message_count: range.map(|(_, _, count)| count),
        }
    }

    /// Fields offered to the channel merge
    #[must_use]
    pub fn to_fields(&self) -> ChannelFields {
        ChannelFields {
            username: self.username.clone(),
            title: self.title.clone(),
            channel_type: self.channel_type.as_deref().and_then(ChannelType::parse),
            notes: self.notes.clone(),
            first_scraped: timestamp(self.first_scraped.as_deref()),
            last_scraped: timestamp(self.last_scraped.as_deref()),
            total_messages: self.total_messages,
            messages_with_coordinates: self.messages_with_coordinates,
            coordinate_density: self.coordinate_density,
            is_active: self.is_active,
        }
    }
}

/// Message row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Surrogate id on the exporting device; never reused on import
    pub id: Option<i64>,
    pub channel_id: i64,
    pub message_id: i64,
    pub message_text: Option<String>,
    pub message_date: Option<String>,
    pub media_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub has_coordinates: Option<bool>,
    pub processed_at: Option<String>,
    pub last_updated: Option<String>,
}

impl From<&StoredMessage> for MessageRow {
    fn from(message: &StoredMessage) -> Self {
        Self {
            id: Some(message.id),
            channel_id: message.channel_id,
            message_id: message.message_id,
            message_text: Some(message.text.clone()),
            message_date: message.date.as_ref().map(format_timestamp),
            media_type: Some(message.media_type.as_str().to_string()),
            has_coordinates: Some(message.has_coordinates),
            processed_at: message.processed_at.as_ref().map(format_timestamp),
            last_updated: message.last_updated.as_ref().map(format_timestamp),
        }
    }
}

impl MessageRow {
    /// Parsed `last_updated`; malformed values count as absent
    #[must_use]
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        timestamp(self.last_updated.as_deref())
    }

    /// `last_updated` for the merge decision, keeping malformed apart from absent
    #[must_use]
    pub fn last_updated_stamp(&self) -> IncomingStamp {
        IncomingStamp::parse(self.last_updated.as_deref())
    }

    /// The row as a new local message (surrogate id left at 0)
    #[must_use]
    pub fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            id: 0,
            channel_id: self.channel_id,
            message_id: self.message_id,
            text: self.message_text.clone().unwrap_or_default(),
            date: timestamp(self.message_date.as_deref()),
            media_type: self.media_type.as_deref().map_or(MediaKind::Text, MediaKind::from_stored),
            has_coordinates: self.has_coordinates.unwrap_or(false),
            processed_at: timestamp(self.processed_at.as_deref()),
            last_updated: self.last_updated_at(),
        }
    }
}

/// Coordinate row, keyed by its message's identity rather than a surrogate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateRow {
    pub channel_id: i64,
    pub message_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub coordinate_format: Option<String>,
    pub extraction_confidence: Option<String>,
    pub created_at: Option<String>,
}

/// Session row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    /// Recording device; falls back to the snapshot's `device_id`
    pub device_id: Option<String>,
    pub session_start: String,
    pub session_end: Option<String>,
    #[serde(default, deserialize_with = "id_list")]
    pub channels_scraped: Vec<i64>,
    pub new_messages: Option<i64>,
    pub new_coordinates: Option<i64>,
    pub skipped_messages: Option<i64>,
    pub session_type: Option<String>,
    pub status: Option<String>,
    pub error_log: Option<String>,
}

impl From<&SyncSession> for SessionRow {
    fn from(session: &SyncSession) -> Self {
        Self {
            device_id: Some(session.device_id.clone()),
            session_start: format_timestamp(&session.session_start),
            session_end: session.session_end.as_ref().map(format_timestamp),
            channels_scraped: session.channels_scraped.clone(),
            new_messages: Some(session.new_messages),
            new_coordinates: Some(session.new_coordinates),
            skipped_messages: Some(session.skipped_messages),
            session_type: Some(session.session_type.clone()),
            status: Some(session.status.as_str().to_string()),
            error_log: session.error_log.clone(),
        }
    }
}

impl SessionRow {
    /// The row as a session of `fallback_device` when it names none.
    ///
    /// Fails when the start time is unreadable.
    pub fn to_session(&self, fallback_device: Option<&str>) -> Result<SyncSession> {
        let device_id = self
            .device_id
            .as_deref()
            .or(fallback_device)
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| Error::MalformedRecord("session without a device id".into()))?;
        let session_start = parse_timestamp(&self.session_start).ok_or_else(|| {
            Error::MalformedRecord(format!("unreadable session start '{}'", self.session_start))
        })?;
        Ok(SyncSession {
            id: 0,
            device_id: device_id.to_string(),
            session_start,
            session_end: timestamp(self.session_end.as_deref()),
            channels_scraped: self.channels_scraped.clone(),
            new_messages: self.new_messages.unwrap_or(0),
            new_coordinates: self.new_coordinates.unwrap_or(0),
            skipped_messages: self.skipped_messages.unwrap_or(0),
            session_type: self.session_type.clone().unwrap_or_else(|| "ingest".to_string()),
            status: self
                .status
                .as_deref()
                .map_or(SessionStatus::Completed, SessionStatus::from_stored),
            error_log: self.error_log.clone(),
        })
    }
}

/// Recommendation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRow {
    pub channel_id: i64,
    pub username: Option<String>,
    pub title: Option<String>,
    pub channel_type: Option<String>,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    #[serde(default, deserialize_with = "id_list")]
    pub discovered_from_channels: Vec<i64>,
    pub forward_count: Option<i64>,
    pub coordinate_forward_count: Option<i64>,
    pub recommendation_score: Option<f64>,
    pub user_status: Option<String>,
    pub user_notes: Option<String>,
}

impl From<&Recommendation> for RecommendationRow {
    fn from(rec: &Recommendation) -> Self {
        Self {
            channel_id: rec.channel_id,
            username: rec.username.clone(),
            title: rec.title.clone(),
            channel_type: rec.channel_type.clone(),
            first_seen: rec.first_seen.as_ref().map(format_timestamp),
            last_seen: rec.last_seen.as_ref().map(format_timestamp),
            discovered_from_channels: rec.discovered_from.clone(),
            forward_count: Some(rec.forward_count),
            coordinate_forward_count: Some(rec.coordinate_forward_count),
            recommendation_score: Some(rec.recommendation_score),
            user_status: Some(rec.user_status.clone()),
            user_notes: rec.user_notes.clone(),
        }
    }
}

impl RecommendationRow {
    /// The row as a recommendation record
    #[must_use]
    pub fn to_recommendation(&self) -> Recommendation {
        Recommendation {
            channel_id: self.channel_id,
            username: self.username.clone(),
            title: self.title.clone(),
            channel_type: self.channel_type.clone(),
            first_seen: timestamp(self.first_seen.as_deref()),
            last_seen: timestamp(self.last_seen.as_deref()),
            discovered_from: self.discovered_from_channels.clone(),
            forward_count: self.forward_count.unwrap_or(0),
            coordinate_forward_count: self.coordinate_forward_count.unwrap_or(0),
            recommendation_score: self.recommendation_score.unwrap_or(0.0),
            user_status: self.user_status.clone().unwrap_or_else(|| "pending".to_string()),
            user_notes: self.user_notes.clone(),
        }
    }
}

/// A complete snapshot document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub export_date: String,
    pub device_id: Option<String>,
    pub schema_version: Option<i64>,
    pub channels: Vec<ChannelRow>,
    pub messages: Vec<MessageRow>,
    #[serde(default)]
    pub coordinates: Vec<CoordinateRow>,
    #[serde(default)]
    pub sessions: Vec<SessionRow>,
    #[serde(default)]
    pub recommendations: Vec<RecommendationRow>,
    /// Rows dropped while reading because they could not be interpreted
    #[serde(skip)]
    pub malformed_rows: usize,
}

impl Snapshot {
    /// Empty snapshot stamped with the current time
    #[must_use]
    pub fn new(device_id: Option<String>, schema_version: Option<i64>) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            export_date: format_timestamp(&Utc::now()),
            device_id,
            schema_version,
            channels: Vec::new(),
            messages: Vec::new(),
            coordinates: Vec::new(),
            sessions: Vec::new(),
            recommendations: Vec::new(),
            malformed_rows: 0,
        }
    }

    /// Write the snapshot; with `compress`, `.gz` is appended when missing.
    ///
    /// Returns the path actually written.
    pub fn write_to(&self, path: &Path, compress: bool) -> Result<PathBuf> {
        let path = if compress && !is_compressed_path(path) {
            let mut name = path.as_os_str().to_owned();
            name.push(".gz");
            PathBuf::from(name)
        } else {
            path.to_path_buf()
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        if is_compressed_path(&path) {
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer(&mut encoder, self)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }
        Ok(path)
    }

    /// Read and validate a snapshot file
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader: Box<dyn Read> = if is_compressed_path(path) {
            Box::new(BufReader::new(GzDecoder::new(BufReader::new(file))))
        } else {
            Box::new(BufReader::new(file))
        };
        let value: Value = serde_json::from_reader(reader)?;
        Self::from_value(value)
    }

    /// Validate a parsed document and convert it row by row.
    ///
    /// Missing required sections are a validation error. Individual rows that
    /// fail to convert are dropped and counted in `malformed_rows`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut document) = value else {
            return Err(Error::Validation("snapshot is not a JSON object".into()));
        };
        for section in REQUIRED_SECTIONS {
            if !document.get(section).is_some_and(Value::is_array) {
                return Err(Error::Validation(format!("snapshot is missing the '{section}' section")));
            }
        }

        let header_str = |document: &Map<String, Value>, key: &str| {
            document.get(key).and_then(Value::as_str).map(str::to_string)
        };
        let mut malformed = 0;
        let mut snapshot = Self {
            version: header_str(&document, "version").unwrap_or_else(|| "1.0".to_string()),
            export_date: header_str(&document, "export_date").unwrap_or_default(),
            device_id: header_str(&document, "device_id"),
            schema_version: document.get("schema_version").and_then(Value::as_i64),
            channels: take_rows(&mut document, "channels", &mut malformed),
            messages: take_rows(&mut document, "messages", &mut malformed),
            coordinates: take_rows(&mut document, "coordinates", &mut malformed),
            sessions: take_rows(&mut document, "sessions", &mut malformed),
            recommendations: take_rows(&mut document, "recommendations", &mut malformed),
            malformed_rows: 0,
        };
        snapshot.malformed_rows = malformed;
        Ok(snapshot)
    }
}

fn take_rows<T: DeserializeOwned>(document: &mut Map<String, Value>, section: &str, malformed: &mut usize) -> Vec<T> {
    let Some(Value::Array(rows)) = document.remove(section) else {
        return Vec::new();
    };
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                *malformed += 1;
                debug!(section, error = %err, "Skipping malformed snapshot row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_sections_are_rejected() {
        let err = Snapshot::from_value(json!({"version": "2.0", "channels": []})).unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("messages")));
        assert!(matches!(Snapshot::from_value(json!([])), Err(Error::Validation(_))));
    }

    #[test]
    fn legacy_rows_are_read_leniently() {
        let snapshot = Snapshot::from_value(json!({
            "version": "1.0",
            "channels": [{"id": 7, "is_active": 1, "total_messages": 3}],
            "messages": [
                {"channel_id": 7, "message_id": 1, "has_coordinates": 0, "last_updated": "2024-01-01 10:00:00"},
                {"channel_id": "seven", "message_id": 2}
            ],
            "recommendations": [{"channel_id": 9, "discovered_from_channels": "[7, 8]"}],
            "sessions": [{"session_start": "2024-01-01T00:00:00", "channels_scraped": "[7]"}]
        }))
        .unwrap();
        assert_eq!(snapshot.channels[0].is_active, Some(true));
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].has_coordinates, Some(false));
        assert!(snapshot.messages[0].last_updated_at().is_some());
        assert_eq!(snapshot.malformed_rows, 1);
        assert_eq!(snapshot.recommendations[0].discovered_from_channels, vec![7, 8]);
        assert_eq!(snapshot.sessions[0].channels_scraped, vec![7]);
        assert!(snapshot.sessions[0].to_session(None).is_err());
        assert_eq!(snapshot.sessions[0].to_session(Some("laptop")).unwrap().device_id, "laptop");
    }

    #[test]
    fn compressed_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut snapshot = Snapshot::new(Some("dev-1".into()), Some(2));
        snapshot.messages.push(MessageRow {
            id: Some(1),
            channel_id: 5,
            message_id: 10,
            message_text: Some("hi".into()),
            message_date: None,
            media_type: Some("text".into()),
            has_coordinates: Some(false),
            processed_at: None,
            last_updated: None,
        });

        let written = snapshot.write_to(&dir.path().join("out.json"), true).unwrap();
        assert_eq!(written.file_name().unwrap(), "out.json.gz");
        assert_eq!(Snapshot::read_from(&written).unwrap(), snapshot);

        let plain = snapshot.write_to(&dir.path().join("plain.json"), false).unwrap();
        assert!(fs::read_to_string(&plain).unwrap().contains("\"version\": \"2.0\""));
    }
}
