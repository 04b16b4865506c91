//! Database schema definitions
//!
//! This module provides constants for table and column names used with rusqlite,
//! along with the column lists the row mappers in [`crate::db`] expect.

/// Version written to the `metadata` table once all migrations have run.
pub const SCHEMA_VERSION: i64 = 2;

/// Channels table schema
pub mod channels {
    /// Table name
    pub const TABLE: &str = "channels";
    /// Primary key column; the externally assigned channel id
    pub const ID: &str = "id";
    /// Public username, without the leading `@`
    pub const USERNAME: &str = "username";
    /// Display title
    pub const TITLE: &str = "title";
    /// channel / supergroup / group
    pub const CHANNEL_TYPE: &str = "channel_type";
    /// First time this device ingested the channel
    pub const FIRST_SCRAPED: &str = "first_scraped";
    /// Most recent ingestion pass
    pub const LAST_SCRAPED: &str = "last_scraped";
    /// Cached message count
    pub const TOTAL_MESSAGES: &str = "total_messages";
    /// Cached count of coordinate-bearing messages
    pub const MESSAGES_WITH_COORDINATES: &str = "messages_with_coordinates";
    /// Cached density percentage
    pub const COORDINATE_DENSITY: &str = "coordinate_density";
    /// Whether the channel is still followed
    pub const IS_ACTIVE: &str = "is_active";
    /// Free-text notes
    pub const NOTES: &str = "notes";
    /// Last mutation of the row
    pub const LAST_UPDATED: &str = "last_updated";
    /// Columns in the order `map_channel` reads them
    pub const SELECT_COLUMNS: &str = "id, username, title, channel_type, first_scraped, \
        last_scraped, total_messages, messages_with_coordinates, coordinate_density, \
        is_active, notes, last_updated";
}

/// Messages table schema
pub mod messages {
    /// Table name
    pub const TABLE: &str = "messages";
    /// Surrogate primary key
    pub const ID: &str = "id";
    /// Owning channel
    pub const CHANNEL_ID: &str = "channel_id";
    /// Externally assigned message id, unique per channel
    pub const MESSAGE_ID: &str = "message_id";
    /// Raw message text
    pub const MESSAGE_TEXT: &str = "message_text";
    /// Publish timestamp
    pub const MESSAGE_DATE: &str = "message_date";
    /// Coarse media classification
    pub const MEDIA_TYPE: &str = "media_type";
    /// Whether any coordinate was extracted
    pub const HAS_COORDINATES: &str = "has_coordinates";
    /// When the row was first written
    pub const PROCESSED_AT: &str = "processed_at";
    /// Last mutation of the row; the export watermark column
    pub const LAST_UPDATED: &str = "last_updated";
    /// Columns in the order `map_message` reads them
    pub const SELECT_COLUMNS: &str = "id, channel_id, message_id, message_text, message_date, \
        media_type, has_coordinates, processed_at, last_updated";
}

/// Coordinates table schema
pub mod coordinates {
    /// Table name
    pub const TABLE: &str = "coordinates";
    /// Surrogate primary key
    pub const ID: &str = "id";
    /// Owning message's surrogate id
    pub const MESSAGE_REF: &str = "message_ref";
    /// Latitude in decimal degrees
    pub const LATITUDE: &str = "latitude";
    /// Longitude in decimal degrees
    pub const LONGITUDE: &str = "longitude";
    /// decimal / dms
    pub const COORDINATE_FORMAT: &str = "coordinate_format";
    /// Optional confidence tag
    pub const EXTRACTION_CONFIDENCE: &str = "extraction_confidence";
    /// Creation timestamp
    pub const CREATED_AT: &str = "created_at";
}

/// Sync (ingestion run) sessions table schema
pub mod sync_sessions {
    /// Table name
    pub const TABLE: &str = "sync_sessions";
    /// Surrogate primary key
    pub const ID: &str = "id";
    /// Device that ran the session
    pub const DEVICE_ID: &str = "device_id";
    /// Start time
    pub const SESSION_START: &str = "session_start";
    /// End time, set on finalization
    pub const SESSION_END: &str = "session_end";
    /// JSON array of channel ids touched
    pub const CHANNELS_SCRAPED: &str = "channels_scraped";
    /// Messages inserted
    pub const NEW_MESSAGES: &str = "new_messages";
    /// Coordinates inserted
    pub const NEW_COORDINATES: &str = "new_coordinates";
    /// Messages skipped
    pub const SKIPPED_MESSAGES: &str = "skipped_messages";
    /// What started the session
    pub const SESSION_TYPE: &str = "session_type";
    /// in_progress / completed / failed
    pub const STATUS: &str = "status";
    /// Failure description
    pub const ERROR_LOG: &str = "error_log";
    /// Columns in the order `map_session` reads them
    pub const SELECT_COLUMNS: &str = "id, device_id, session_start, session_end, \
        channels_scraped, new_messages, new_coordinates, skipped_messages, session_type, \
        status, error_log";
}

/// Outbound links found in message text
pub mod message_links {
    /// Table name
    pub const TABLE: &str = "message_links";
    /// Owning message's surrogate id
    pub const MESSAGE_REF: &str = "message_ref";
    /// Normalised URL
    pub const URL: &str = "url";
    /// Host part of the URL
    pub const DOMAIN: &str = "domain";
    /// telegram / video / government / external
    pub const CATEGORY: &str = "category";
}

/// Channels discovered through forwards
pub mod recommended_channels {
    /// Table name
    pub const TABLE: &str = "recommended_channels";
    /// Identity column
    pub const CHANNEL_ID: &str = "channel_id";
    /// Columns in the order `map_recommendation` reads them
    pub const SELECT_COLUMNS: &str = "channel_id, username, title, channel_type, first_seen, \
        last_seen, discovered_from_channels, forward_count, coordinate_forward_count, \
        recommendation_score, user_status, user_notes";
}

/// Forward edges between channels
pub mod channel_forwards {
    /// Table name
    pub const TABLE: &str = "channel_forwards";
}

/// Audit trail of imports
pub mod import_history {
    /// Table name
    pub const TABLE: &str = "import_history";
}

/// Key/value metadata
pub mod metadata {
    /// Table name
    pub const TABLE: &str = "metadata";
    /// Stable per-installation identifier
    pub const DEVICE_ID_KEY: &str = "device_id";
    /// Applied schema version
    pub const SCHEMA_VERSION_KEY: &str = "schema_version";
}
