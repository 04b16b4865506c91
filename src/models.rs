//! Data models for channels, messages and coordinates
//!
//! This module contains the record types shared by the store, the ingestion
//! pipeline and the sync engine. Optional fields use `None` for "absent";
//! the merge rules in [`crate::merge`] never let an absent value replace a
//! present one.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of channel as reported by the messaging network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Broadcast channel
    Channel,
    /// Large discussion group
    Supergroup,
    /// Basic group
    Group,
}

impl ChannelType {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Supergroup => "supergroup",
            Self::Group => "group",
        }
    }

    /// Parse a stored value; unknown values are treated as absent
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "channel" => Some(Self::Channel),
            "supergroup" | "megagroup" => Some(Self::Supergroup),
            "group" | "chat" | "private_group" | "public_supergroup" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Coarse media classification of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// No attachment
    #[default]
    Text,
    /// Photo attachment
    Photo,
    /// Video attachment
    Video,
    /// Any other attachment
    Other,
}

impl MediaKind {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Other => "other",
        }
    }

    /// Parse a stored value; anything unrecognised is `Other`
    #[must_use]
    pub fn from_stored(raw: &str) -> Self {
        match raw {
            "text" | "" => Self::Text,
            "photo" => Self::Photo,
            "video" => Self::Video,
            _ => Self::Other,
        }
    }
}

/// How a coordinate pair was written in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateFormat {
    /// `40.7306, -73.9352`
    #[default]
    Decimal,
    /// Degrees, minutes, seconds with hemisphere letters
    Dms,
}

impl CoordinateFormat {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decimal => "decimal",
            Self::Dms => "dms",
        }
    }

    /// Parse a stored value
    #[must_use]
    pub fn from_stored(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("dms") {
            Self::Dms
        } else {
            Self::Decimal
        }
    }
}

/// Lifecycle of an ingestion session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Started, not yet finalized
    InProgress,
    /// Finished without a run-level failure
    Completed,
    /// Aborted by a store failure or cancellation
    Failed,
}

impl SessionStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a stored value; unknown values read as in-progress
    #[must_use]
    pub fn from_stored(raw: &str) -> Self {
        match raw {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer kind of a forward origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Broadcast channel or supergroup
    Channel,
    /// Basic group
    Chat,
    /// Individual user account
    User,
    /// The source could not tell
    Unknown,
}

/// Where a forwarded message originally came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOrigin {
    /// Peer kind
    pub kind: PeerKind,
    /// Numeric peer id
    pub id: i64,
    /// Display name, when the source exposes one
    pub title: Option<String>,
    /// Public username, when the source exposes one
    pub username: Option<String>,
}

/// Channel identity and metadata as resolved by a message source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Numeric channel id (negative for some private groups)
    pub id: i64,
    /// Public username
    pub username: Option<String>,
    /// Display title
    pub title: Option<String>,
    /// Channel kind
    pub channel_type: Option<ChannelType>,
}

/// A stored channel row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Numeric channel id
    pub id: i64,
    /// Public username
    pub username: Option<String>,
    /// Display title
    pub title: Option<String>,
    /// Channel kind
    pub channel_type: Option<ChannelType>,
    /// First ingestion on this device
    pub first_scraped: Option<DateTime<Utc>>,
    /// Most recent ingestion
    pub last_scraped: Option<DateTime<Utc>>,
    /// Cached message count
    pub total_messages: i64,
    /// Cached count of coordinate-bearing messages
    pub messages_with_coordinates: i64,
    /// Cached density percentage, two decimal places
    pub coordinate_density: f64,
    /// Whether the channel is still followed
    pub is_active: bool,
    /// Free-text notes
    pub notes: Option<String>,
    /// Last mutation of the row
    pub last_updated: Option<DateTime<Utc>>,
}

/// Field values offered to [`crate::db::Database::upsert_channel`].
///
/// Every field is optional; an absent field never clears a stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelFields {
    /// Public username
    pub username: Option<String>,
    /// Display title
    pub title: Option<String>,
    /// Channel kind
    pub channel_type: Option<ChannelType>,
    /// Free-text notes
    pub notes: Option<String>,
    /// First ingestion time
    pub first_scraped: Option<DateTime<Utc>>,
    /// Most recent ingestion time
    pub last_scraped: Option<DateTime<Utc>>,
    /// Message count
    pub total_messages: Option<i64>,
    /// Coordinate-bearing message count
    pub messages_with_coordinates: Option<i64>,
    /// Density percentage
    pub coordinate_density: Option<f64>,
    /// Active flag
    pub is_active: Option<bool>,
}

impl From<&ChannelInfo> for ChannelFields {
    fn from(info: &ChannelInfo) -> Self {
        Self {
            username: info.username.clone(),
            title: info.title.clone(),
            channel_type: info.channel_type,
            ..Self::default()
        }
    }
}

/// A message as written by the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Externally assigned message id
    pub message_id: i64,
    /// Raw text, possibly empty
    pub text: String,
    /// Publish time
    pub date: Option<DateTime<Utc>>,
    /// Media classification
    pub media_type: MediaKind,
    /// Whether any coordinate was extracted
    pub has_coordinates: bool,
}

/// A stored message row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Surrogate id
    pub id: i64,
    /// Owning channel
    pub channel_id: i64,
    /// Externally assigned message id
    pub message_id: i64,
    /// Raw text
    pub text: String,
    /// Publish time
    pub date: Option<DateTime<Utc>>,
    /// Media classification
    pub media_type: MediaKind,
    /// Whether any coordinate was extracted
    pub has_coordinates: bool,
    /// When the row was first written
    pub processed_at: Option<DateTime<Utc>>,
    /// Last mutation
    pub last_updated: Option<DateTime<Utc>>,
}

/// A coordinate to append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCoordinate {
    /// Owning message's surrogate id
    pub message_ref: i64,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Source notation
    pub format: CoordinateFormat,
    /// Optional confidence tag
    pub confidence: Option<String>,
}

/// A stored coordinate row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCoordinate {
    /// Surrogate id
    pub id: i64,
    /// Owning message's surrogate id
    pub message_ref: i64,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Source notation
    pub format: CoordinateFormat,
    /// Optional confidence tag
    pub confidence: Option<String>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

/// One ingestion run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    /// Surrogate id
    pub id: i64,
    /// Device that ran the session
    pub device_id: String,
    /// Start time
    pub session_start: DateTime<Utc>,
    /// End time, once finalized
    pub session_end: Option<DateTime<Utc>>,
    /// Channels touched
    pub channels_scraped: Vec<i64>,
    /// Messages inserted
    pub new_messages: i64,
    /// Coordinates inserted
    pub new_coordinates: i64,
    /// Messages skipped
    pub skipped_messages: i64,
    /// What started the session
    pub session_type: String,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Failure description
    pub error_log: Option<String>,
}

/// Totals written when a session is finalized
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Channels touched
    pub channels_scraped: Vec<i64>,
    /// Messages inserted
    pub new_messages: i64,
    /// Coordinates inserted
    pub new_coordinates: i64,
    /// Messages skipped
    pub skipped_messages: i64,
}

/// Category of an outbound link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkCategory {
    /// t.me / telegram.me
    Telegram,
    /// youtube.com / youtu.be
    Video,
    /// .gov, .gov.uk, .mil hosts
    Government,
    /// Everything else
    External,
}

impl LinkCategory {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Telegram => "telegram",
            Self::Video => "video",
            Self::Government => "government",
            Self::External => "external",
        }
    }
}

/// A normalised link found in message text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLink {
    /// Normalised URL
    pub url: String,
    /// Host part, lowercased
    pub domain: Option<String>,
    /// Category
    pub category: LinkCategory,
}

/// A channel discovered through forwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Identity
    pub channel_id: i64,
    /// Public username
    pub username: Option<String>,
    /// Display title
    pub title: Option<String>,
    /// Channel kind
    pub channel_type: Option<String>,
    /// First time a forward from this channel was seen
    pub first_seen: Option<DateTime<Utc>>,
    /// Most recent forward
    pub last_seen: Option<DateTime<Utc>>,
    /// Channels whose messages forwarded from it
    pub discovered_from: Vec<i64>,
    /// Forwards observed
    pub forward_count: i64,
    /// Forwards that carried coordinates
    pub coordinate_forward_count: i64,
    /// Score from the configured scorer
    pub recommendation_score: f64,
    /// pending / accepted / rejected
    pub user_status: String,
    /// Free-text notes
    pub user_notes: Option<String>,
}

/// Aggregate figures for the whole store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStatistics {
    /// Message rows
    pub total_messages: i64,
    /// Coordinate rows
    pub total_coordinates: i64,
    /// Channel rows
    pub tracked_channels: i64,
    /// Channels flagged active
    pub active_channels: i64,
    /// Mean density over channels holding messages
    pub average_density: f64,
    /// Most recent ingestion across all channels
    pub last_scrape: Option<DateTime<Utc>>,
}

/// One row of the import audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportHistoryEntry {
    /// Source file path
    pub source_file: String,
    /// Device id recorded in the source
    pub source_device: Option<String>,
    /// `snapshot` or `store`
    pub import_type: String,
    /// Merge strategy used
    pub strategy: String,
    /// Serialized statistics
    pub stats: serde_json::Value,
    /// `completed` or `failed`
    pub status: String,
    /// Failure description
    pub error: Option<String>,
}

/// Two coordinates of the same message closer than this on both axes are the
/// same point.
pub const COORDINATE_TOLERANCE: f64 = 1e-9;

/// Whether `a` and `b` (latitude, longitude) are within [`COORDINATE_TOLERANCE`].
#[must_use]
pub fn same_point(a: (f64, f64), b: (f64, f64)) -> bool {
    (a.0 - b.0).abs() < COORDINATE_TOLERANCE && (a.1 - b.1).abs() < COORDINATE_TOLERANCE
}

/// Round a density percentage to two decimal places.
#[must_use]
pub fn density_percent(with_coordinates: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let raw = with_coordinates as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_rounds_to_two_places() {
        assert!((density_percent(1, 3) - 33.33).abs() < f64::EPSILON);
        assert!((density_percent(2, 3) - 66.67).abs() < f64::EPSILON);
        assert!((density_percent(0, 0)).abs() < f64::EPSILON);
    }

    #[test]
    fn channel_type_accepts_legacy_names() {
        assert_eq!(ChannelType::parse("megagroup"), Some(ChannelType::Supergroup));
        assert_eq!(ChannelType::parse("Channel"), Some(ChannelType::Channel));
        assert_eq!(ChannelType::parse("bot"), None);
    }

    #[test]
    fn unknown_media_is_other() {
        assert_eq!(MediaKind::from_stored("document"), MediaKind::Other);
        assert_eq!(MediaKind::from_stored("photo"), MediaKind::Photo);
    }
}
