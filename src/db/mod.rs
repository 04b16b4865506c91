//! SQLite persistence for channels, messages, coordinates and sessions.
//!
//! [`Database`] owns an r2d2 pool and exposes the store operations as
//! methods. The same operations are available as free functions in the
//! submodules taking a `&Connection`, so callers that need several of them to
//! commit together (an ingestion batch, a whole import) can run them inside
//! one transaction.

pub mod admin;
pub mod channels;
pub mod messages;
pub mod recommendations;
pub mod sessions;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::merge::ChannelRules;
use crate::models::{
    Channel, ChannelFields, DatabaseStatistics, ImportHistoryEntry, MessageLink, MessageRecord,
    NewCoordinate, SessionStats, SessionStatus, StoredCoordinate, StoredMessage, SyncSession,
};
use crate::schema::{self, metadata};
use crate::utils::now_timestamp;

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Tables a store must contain to be readable as an import source.
pub const REQUIRED_TABLES: [&str; 3] = ["channels", "messages", "coordinates"];

const MIGRATIONS: [(&str, &str); 2] = [
    (
        "create_core_tables",
        include_str!("../../migrations/2026-01-10-000000_create_core_tables/up.sql"),
    ),
    (
        "add_side_tables",
        include_str!("../../migrations/2026-01-10-000001_add_side_tables/up.sql"),
    ),
];

/// Database manager for handling connections and operations
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) a store with default pool settings
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, 4, Duration::from_millis(5_000))
    }

    /// Open a store using the `[database]` configuration section
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::with_options(
            &config.path,
            config.max_connections,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// Open (creating if needed) a store with explicit pool settings
    pub fn with_options(
        path: impl AsRef<Path>,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        });
        let pool = Pool::builder().max_size(max_connections.max(1)).build(manager)?;

        let db = Self { pool, path };
        let conn = db.get_connection()?;
        Self::run_migrations(&conn)?;
        info!(path = %db.path.display(), "Store opened");
        Ok(db)
    }

    /// Open an existing store read-only, without running migrations.
    ///
    /// Used to read a foreign store during a direct-store import. A file that
    /// lacks any of [`REQUIRED_TABLES`] is rejected.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::Validation(format!(
                "Source store not found: {}",
                path.display()
            )));
        }
        let manager = SqliteConnectionManager::file(&path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool, path };

        let conn = db.get_connection()?;
        let missing: Vec<&str> = REQUIRED_TABLES
            .iter()
            .copied()
            .filter(|table| !table_exists(&conn, table).unwrap_or(false))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "{} is not a coordinates store (missing tables: {})",
                db.path.display(),
                missing.join(", ")
            )));
        }
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> Result<()> {
        for (name, sql) in MIGRATIONS {
            conn.execute_batch(sql)?;
            debug!(migration = name, "Migration applied");
        }
        set_metadata(
            conn,
            metadata::SCHEMA_VERSION_KEY,
            &schema::SCHEMA_VERSION.to_string(),
        )?;
        Ok(())
    }

    /// Path of the underlying database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside an IMMEDIATE transaction and commit if it succeeds.
    ///
    /// Any error rolls the transaction back and leaves the store unchanged.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside an IMMEDIATE transaction that is always rolled back.
    pub fn with_rollback<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = f(&tx);
        tx.rollback()?;
        outcome
    }

    /// Read a metadata value
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        get_metadata(&*self.get_connection()?, key)
    }

    /// Write a metadata value
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata(&*self.get_connection()?, key, value)
    }

    /// Stable identifier of this installation, generated on first use
    pub fn device_id(&self) -> Result<String> {
        device_id(&*self.get_connection()?)
    }

    /// Schema version recorded in metadata, if any
    pub fn schema_version(&self) -> Result<Option<i64>> {
        schema_version(&*self.get_connection()?)
    }

    // ---- channels -------------------------------------------------------

    /// Fetch one channel
    pub fn get_channel(&self, channel_id: i64) -> Result<Option<Channel>> {
        channels::get_channel(&*self.get_connection()?, channel_id)
    }

    /// All channels ordered by id
    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        channels::list_channels(&*self.get_connection()?)
    }

    /// Insert or merge a channel; returns `true` when the row was created
    pub fn upsert_channel(
        &self,
        channel_id: i64,
        fields: &ChannelFields,
        rules: &ChannelRules,
    ) -> Result<bool> {
        channels::upsert_channel(&*self.get_connection()?, channel_id, fields, rules)
    }

    /// Recompute the cached counters of a channel from the message table
    pub fn recompute_channel_statistics(&self, channel_id: i64) -> Result<Option<Channel>> {
        channels::recompute_channel_statistics(&*self.get_connection()?, channel_id)
    }

    /// Highest ingested message id of a channel
    pub fn latest_message_id(&self, channel_id: i64) -> Result<Option<i64>> {
        channels::latest_message_id(&*self.get_connection()?, channel_id)
    }

    /// Delete a channel and everything it owns
    pub fn reset_channel(&self, channel_id: i64) -> Result<bool> {
        channels::reset_channel(&*self.get_connection()?, channel_id)
    }

    // ---- messages -------------------------------------------------------

    /// Whether a (channel, message id) pair is stored
    pub fn message_exists(&self, channel_id: i64, message_id: i64) -> Result<bool> {
        messages::message_exists(&*self.get_connection()?, channel_id, message_id)
    }

    /// Which of `message_ids` are already stored for the channel
    pub fn bulk_check_existence(
        &self,
        channel_id: i64,
        message_ids: &[i64],
    ) -> Result<HashSet<i64>> {
        messages::bulk_check_existence(&*self.get_connection()?, channel_id, message_ids)
    }

    /// Insert or update messages in one transaction
    pub fn bulk_insert_messages(
        &self,
        channel_id: i64,
        records: &[MessageRecord],
    ) -> Result<HashMap<i64, i64>> {
        self.with_transaction(|tx| messages::bulk_insert_messages(tx, channel_id, records))
    }

    /// Append coordinates in one transaction
    pub fn bulk_insert_coordinates(&self, coordinates: &[NewCoordinate]) -> Result<usize> {
        self.with_transaction(|tx| messages::bulk_insert_coordinates(tx, coordinates))
    }

    /// Fetch one message by identity
    pub fn get_message(&self, channel_id: i64, message_id: i64) -> Result<Option<StoredMessage>> {
        messages::get_message(&*self.get_connection()?, channel_id, message_id)
    }

    /// Coordinates attached to a message
    pub fn coordinates_for_message(&self, message_ref: i64) -> Result<Vec<StoredCoordinate>> {
        messages::coordinates_for_message(&*self.get_connection()?, message_ref)
    }

    /// Links attached to a message
    pub fn links_for_message(&self, message_ref: i64) -> Result<Vec<MessageLink>> {
        messages::links_for_message(&*self.get_connection()?, message_ref)
    }

    // ---- sessions -------------------------------------------------------

    /// Open an ingestion session
    pub fn start_session(&self, session_type: &str) -> Result<i64> {
        let conn = self.get_connection()?;
        let device = device_id(&conn)?;
        sessions::start_session(&conn, &device, session_type)
    }

    /// Finalize an ingestion session
    pub fn end_session(
        &self,
        session_id: i64,
        stats: &SessionStats,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sessions::end_session(&*self.get_connection()?, session_id, stats, status, error)
    }

    /// Fetch one session
    pub fn get_session(&self, session_id: i64) -> Result<Option<SyncSession>> {
        sessions::get_session(&*self.get_connection()?, session_id)
    }

    /// Most recent sessions first
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<SyncSession>> {
        sessions::recent_sessions(&*self.get_connection()?, limit)
    }

    // ---- administration -------------------------------------------------

    /// Copy the store to `destination` with SQLite's online backup
    pub fn backup_to(&self, destination: &Path) -> Result<PathBuf> {
        admin::backup_to(&*self.get_connection()?, destination)
    }

    /// Back up next to the store (or into `dir`) under a timestamped name
    pub fn backup_timestamped(&self, dir: Option<&Path>) -> Result<PathBuf> {
        let destination = admin::timestamped_backup_path(&self.path, dir);
        self.backup_to(&destination)
    }

    /// Rebuild the database file
    pub fn vacuum(&self) -> Result<()> {
        admin::vacuum(&*self.get_connection()?)
    }

    /// Store-wide figures
    pub fn statistics(&self) -> Result<DatabaseStatistics> {
        admin::statistics(&*self.get_connection()?)
    }

    /// Append to the import audit trail
    pub fn log_import(&self, entry: &ImportHistoryEntry) -> Result<i64> {
        admin::log_import(&*self.get_connection()?, entry)
    }

    /// Most recent import audit entries first
    pub fn import_history(&self, limit: usize) -> Result<Vec<ImportHistoryEntry>> {
        admin::import_history(&*self.get_connection()?, limit)
    }
}

/// Whether `table` exists in the main schema
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Read a metadata value
pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", metadata::TABLE),
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Write a metadata value
pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
             WHERE value IS NOT excluded.value",
            metadata::TABLE
        ),
        params![key, value, now_timestamp()],
    )?;
    Ok(())
}

/// Stable identifier of this installation, generated on first use
pub fn device_id(conn: &Connection) -> Result<String> {
    if let Some(existing) = get_metadata(conn, metadata::DEVICE_ID_KEY)? {
        return Ok(existing);
    }
    let generated = generate_device_id();
    set_metadata(conn, metadata::DEVICE_ID_KEY, &generated)?;
    info!(device_id = %generated, "Generated device identifier");
    Ok(generated)
}

/// Schema version recorded in metadata
pub fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    if !table_exists(conn, metadata::TABLE)? {
        return Ok(None);
    }
    Ok(get_metadata(conn, metadata::SCHEMA_VERSION_KEY)?.and_then(|v| v.parse().ok()))
}

fn generate_device_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "device".to_string());
    format!("{host}-{:08x}", rand::random::<u32>())
}
