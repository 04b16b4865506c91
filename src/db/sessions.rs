//! Ingestion session bracketing.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{Error, Result};
use crate::merge::{merge_field, RECORD_IMPORT_RULE};
use crate::models::{SessionStats, SessionStatus, SyncSession};
use crate::schema::sync_sessions;
use crate::utils::{format_timestamp, now_timestamp, parse_timestamp};

pub(crate) fn map_session(row: &Row<'_>) -> rusqlite::Result<SyncSession> {
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;
    let channels: String = row.get(4)?;
    let status: String = row.get(9)?;
    let session_start = parse_timestamp(&start).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unreadable session_start '{start}'").into(),
        )
    })?;
    Ok(SyncSession {
        id: row.get(0)?,
        device_id: row.get(1)?,
        session_start,
        session_end: end.as_deref().and_then(parse_timestamp),
        channels_scraped: serde_json::from_str(&channels).unwrap_or_default(),
        new_messages: row.get(5)?,
        new_coordinates: row.get(6)?,
        skipped_messages: row.get(7)?,
        session_type: row.get(8)?,
        status: SessionStatus::from_stored(&status),
        error_log: row.get(10)?,
    })
}

/// Open a session in the `in_progress` state
pub fn start_session(conn: &Connection, device_id: &str, session_type: &str) -> Result<i64> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4)",
            sync_sessions::TABLE,
            sync_sessions::DEVICE_ID,
            sync_sessions::SESSION_START,
            sync_sessions::SESSION_TYPE,
            sync_sessions::STATUS
        ),
        params![
            device_id,
            now_timestamp(),
            session_type,
            SessionStatus::InProgress.as_str()
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(session_id = id, "Session started");
    Ok(id)
}

/// Finalize a session with its totals.
///
/// The end time is clamped to the start time so a clock step backwards
/// cannot produce `end < start`.
pub fn end_session(
    conn: &Connection,
    session_id: i64,
    stats: &SessionStats,
    status: SessionStatus,
    error: Option<&str>,
) -> Result<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {t} SET {end} = MAX(?2, {start}), {ch} = ?3, {nm} = ?4, {nc} = ?5, \
             {sk} = ?6, {st} = ?7, {err} = ?8 WHERE {id} = ?1",
            t = sync_sessions::TABLE,
            end = sync_sessions::SESSION_END,
            start = sync_sessions::SESSION_START,
            ch = sync_sessions::CHANNELS_SCRAPED,
            nm = sync_sessions::NEW_MESSAGES,
            nc = sync_sessions::NEW_COORDINATES,
            sk = sync_sessions::SKIPPED_MESSAGES,
            st = sync_sessions::STATUS,
            err = sync_sessions::ERROR_LOG,
            id = sync_sessions::ID,
        ),
        params![
            session_id,
            now_timestamp(),
            serde_json::to_string(&stats.channels_scraped)?,
            stats.new_messages,
            stats.new_coordinates,
            stats.skipped_messages,
            status.as_str(),
            error,
        ],
    )?;
    if updated == 0 {
        return Err(Error::Other(format!("Session {session_id} does not exist")));
    }
    debug!(session_id, status = %status, "Session finalized");
    Ok(())
}

/// Fetch one session
pub fn get_session(conn: &Connection, session_id: i64) -> Result<Option<SyncSession>> {
    let session = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                sync_sessions::SELECT_COLUMNS,
                sync_sessions::TABLE,
                sync_sessions::ID
            ),
            params![session_id],
            map_session,
        )
        .optional()?;
    Ok(session)
}

/// Most recent sessions first
pub fn recent_sessions(conn: &Connection, limit: usize) -> Result<Vec<SyncSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY {} DESC, {} DESC LIMIT ?1",
        sync_sessions::SELECT_COLUMNS,
        sync_sessions::TABLE,
        sync_sessions::SESSION_START,
        sync_sessions::ID
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit], map_session)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Sessions whose start or end is after `since` (all when `None`), oldest first
pub fn sessions_since(conn: &Connection, since: Option<&str>) -> Result<Vec<SyncSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {cols} FROM {t} WHERE ?1 IS NULL OR {start} > ?1 OR {end} > ?1 ORDER BY {id}",
        cols = sync_sessions::SELECT_COLUMNS,
        t = sync_sessions::TABLE,
        start = sync_sessions::SESSION_START,
        end = sync_sessions::SESSION_END,
        id = sync_sessions::ID,
    ))?;
    let rows = stmt.query_map(params![since], map_session)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Merge a session recorded on another device, keyed by
/// (device id, start time). Present incoming fields overwrite stored ones.
///
/// Returns `true` when the session was new to this store.
pub fn merge_session(conn: &Connection, incoming: &SyncSession) -> Result<bool> {
    let existing = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2",
                sync_sessions::SELECT_COLUMNS,
                sync_sessions::TABLE,
                sync_sessions::DEVICE_ID,
                sync_sessions::SESSION_START
            ),
            params![incoming.device_id, format_timestamp(&incoming.session_start)],
            map_session,
        )
        .optional()?;

    let (merged, is_new) = match existing {
        None => (incoming.clone(), true),
        Some(current) => {
            let rule = RECORD_IMPORT_RULE;
            let channels = if incoming.channels_scraped.is_empty() {
                current.channels_scraped.clone()
            } else {
                incoming.channels_scraped.clone()
            };
            let merged = SyncSession {
                id: current.id,
                device_id: current.device_id.clone(),
                session_start: current.session_start,
                session_end: merge_field(rule, current.session_end, incoming.session_end),
                channels_scraped: channels,
                new_messages: incoming.new_messages,
                new_coordinates: incoming.new_coordinates,
                skipped_messages: incoming.skipped_messages,
                session_type: merge_field(
                    rule,
                    Some(current.session_type.clone()),
                    Some(incoming.session_type.clone()),
                )
                .unwrap_or_default(),
                status: incoming.status,
                error_log: merge_field(rule, current.error_log.clone(), incoming.error_log.clone()),
            };
            if merged == current {
                return Ok(false);
            }
            (merged, false)
        }
    };

    conn.execute(
        &format!(
            "INSERT INTO {t} ({dev}, {start}, {end}, {ch}, {nm}, {nc}, {sk}, {ty}, {st}, {err})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT({dev}, {start}) DO UPDATE SET
                {end} = excluded.{end}, {ch} = excluded.{ch}, {nm} = excluded.{nm},
                {nc} = excluded.{nc}, {sk} = excluded.{sk}, {ty} = excluded.{ty},
                {st} = excluded.{st}, {err} = excluded.{err}",
            t = sync_sessions::TABLE,
            dev = sync_sessions::DEVICE_ID,
            start = sync_sessions::SESSION_START,
            end = sync_sessions::SESSION_END,
            ch = sync_sessions::CHANNELS_SCRAPED,
            nm = sync_sessions::NEW_MESSAGES,
            nc = sync_sessions::NEW_COORDINATES,
            sk = sync_sessions::SKIPPED_MESSAGES,
            ty = sync_sessions::SESSION_TYPE,
            st = sync_sessions::STATUS,
            err = sync_sessions::ERROR_LOG,
        ),
        params![
            merged.device_id,
            format_timestamp(&merged.session_start),
            merged.session_end.as_ref().map(format_timestamp),
            serde_json::to_string(&merged.channels_scraped)?,
            merged.new_messages,
            merged.new_coordinates,
            merged.skipped_messages,
            merged.session_type,
            merged.status.as_str(),
            merged.error_log,
        ],
    )?;
    Ok(is_new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        let id = db.start_session("ingest").unwrap();
        let open = db.get_session(id).unwrap().unwrap();
        assert_eq!(open.status, SessionStatus::InProgress);
        assert!(open.session_end.is_none());

        let stats = SessionStats {
            channels_scraped: vec![1001],
            new_messages: 3,
            new_coordinates: 1,
            skipped_messages: 0,
        };
        db.end_session(id, &stats, SessionStatus::Completed, None).unwrap();
        let closed = db.get_session(id).unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Completed);
        assert_eq!(closed.channels_scraped, vec![1001]);
        assert!(closed.session_end.unwrap() >= closed.session_start);
        assert_eq!(db.recent_sessions(5).unwrap().len(), 1);
    }

    #[test]
    fn ending_an_unknown_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        let err = db
            .end_session(99, &SessionStats::default(), SessionStatus::Failed, Some("x"))
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }
}
