//! Message, coordinate and link rows.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{
    CoordinateFormat, LinkCategory, MediaKind, MessageLink, MessageRecord, NewCoordinate,
    StoredCoordinate, StoredMessage,
};
use crate::schema::{coordinates, message_links, messages};
use crate::utils::{format_timestamp, now_timestamp, parse_timestamp, placeholders, MAX_IN_CLAUSE};

pub(crate) fn map_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let date: Option<String> = row.get(4)?;
    let media: String = row.get(5)?;
    let processed_at: Option<String> = row.get(7)?;
    let last_updated: Option<String> = row.get(8)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        message_id: row.get(2)?,
        text: row.get(3)?,
        date: date.as_deref().and_then(parse_timestamp),
        media_type: MediaKind::from_stored(&media),
        has_coordinates: row.get(6)?,
        processed_at: processed_at.as_deref().and_then(parse_timestamp),
        last_updated: last_updated.as_deref().and_then(parse_timestamp),
    })
}

fn map_coordinate(row: &Row<'_>) -> rusqlite::Result<StoredCoordinate> {
    let format: String = row.get(4)?;
    let created_at: Option<String> = row.get(6)?;
    Ok(StoredCoordinate {
        id: row.get(0)?,
        message_ref: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        format: CoordinateFormat::from_stored(&format),
        confidence: row.get(5)?,
        created_at: created_at.as_deref().and_then(parse_timestamp),
    })
}

/// Whether a (channel, message id) pair is stored
pub fn message_exists(conn: &Connection, channel_id: i64, message_id: i64) -> Result<bool> {
    let found: bool = conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1 AND {} = ?2)",
            messages::TABLE,
            messages::CHANNEL_ID,
            messages::MESSAGE_ID
        ),
        params![channel_id, message_id],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Map of message id to surrogate id for the stored subset of `message_ids`.
///
/// One query per [`MAX_IN_CLAUSE`] ids, so an ingestion batch costs a single
/// round trip.
pub fn existing_message_refs(
    conn: &Connection,
    channel_id: i64,
    message_ids: &[i64],
) -> Result<HashMap<i64, i64>> {
    let mut found = HashMap::with_capacity(message_ids.len());
    for chunk in message_ids.chunks(MAX_IN_CLAUSE) {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE {} = ? AND {} IN ({})",
            messages::MESSAGE_ID,
            messages::ID,
            messages::TABLE,
            messages::CHANNEL_ID,
            messages::MESSAGE_ID,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let values = std::iter::once(channel_id).chain(chunk.iter().copied());
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (message_id, surrogate) = row?;
            found.insert(message_id, surrogate);
        }
    }
    Ok(found)
}

/// Which of `message_ids` are already stored for the channel
pub fn bulk_check_existence(
    conn: &Connection,
    channel_id: i64,
    message_ids: &[i64],
) -> Result<HashSet<i64>> {
    Ok(existing_message_refs(conn, channel_id, message_ids)?
        .into_keys()
        .collect())
}

/// Insert new messages and update the mutable fields of stored ones.
///
/// The identity and `processed_at` of a stored row never change, and
/// `last_updated` only moves when a mutable field actually changed. Returns
/// the surrogate id of every record, new or pre-existing.
pub fn bulk_insert_messages(
    conn: &Connection,
    channel_id: i64,
    records: &[MessageRecord],
) -> Result<HashMap<i64, i64>> {
    let now = now_timestamp();
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {t} ({ch}, {mid}, {txt}, {dt}, {media}, {hc}, {pa}, {lu})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT({ch}, {mid}) DO UPDATE SET
            {lu} = CASE WHEN {txt} IS NOT excluded.{txt}
                          OR {dt} IS NOT excluded.{dt}
                          OR {media} IS NOT excluded.{media}
                          OR {hc} IS NOT excluded.{hc}
                        THEN excluded.{lu} ELSE {lu} END,
            {txt} = excluded.{txt},
            {dt} = excluded.{dt},
            {media} = excluded.{media},
            {hc} = excluded.{hc}
         RETURNING {id}",
        t = messages::TABLE,
        id = messages::ID,
        ch = messages::CHANNEL_ID,
        mid = messages::MESSAGE_ID,
        txt = messages::MESSAGE_TEXT,
        dt = messages::MESSAGE_DATE,
        media = messages::MEDIA_TYPE,
        hc = messages::HAS_COORDINATES,
        pa = messages::PROCESSED_AT,
        lu = messages::LAST_UPDATED,
    ))?;

    let mut refs = HashMap::with_capacity(records.len());
    for record in records {
        let surrogate: i64 = stmt.query_row(
            params![
                channel_id,
                record.message_id,
                record.text,
                record.date.as_ref().map(format_timestamp),
                record.media_type.as_str(),
                record.has_coordinates,
                now,
            ],
            |row| row.get(0),
        )?;
        refs.insert(record.message_id, surrogate);
    }
    Ok(refs)
}

/// Append coordinates without any dedup
pub fn bulk_insert_coordinates(conn: &Connection, rows: &[NewCoordinate]) -> Result<usize> {
    let now = now_timestamp();
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {} ({}, {}, {}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        coordinates::TABLE,
        coordinates::MESSAGE_REF,
        coordinates::LATITUDE,
        coordinates::LONGITUDE,
        coordinates::COORDINATE_FORMAT,
        coordinates::EXTRACTION_CONFIDENCE,
        coordinates::CREATED_AT
    ))?;
    for row in rows {
        stmt.execute(params![
            row.message_ref,
            row.latitude,
            row.longitude,
            row.format.as_str(),
            row.confidence,
            now,
        ])?;
    }
    Ok(rows.len())
}

/// Existing (latitude, longitude) pairs grouped by owning message
pub fn coordinate_points(
    conn: &Connection,
    message_refs: &[i64],
) -> Result<HashMap<i64, Vec<(f64, f64)>>> {
    let mut points: HashMap<i64, Vec<(f64, f64)>> = HashMap::new();
    for chunk in message_refs.chunks(MAX_IN_CLAUSE) {
        let sql = format!(
            "SELECT {}, {}, {} FROM {} WHERE {} IN ({})",
            coordinates::MESSAGE_REF,
            coordinates::LATITUDE,
            coordinates::LONGITUDE,
            coordinates::TABLE,
            coordinates::MESSAGE_REF,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (message_ref, lat, lon) = row?;
            points.entry(message_ref).or_default().push((lat, lon));
        }
    }
    Ok(points)
}

/// Coordinates attached to a message, oldest first
pub fn coordinates_for_message(conn: &Connection, message_ref: i64) -> Result<Vec<StoredCoordinate>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {}, {}, {}, {}, {}, {}, {} FROM {} WHERE {} = ?1 ORDER BY {}",
        coordinates::ID,
        coordinates::MESSAGE_REF,
        coordinates::LATITUDE,
        coordinates::LONGITUDE,
        coordinates::COORDINATE_FORMAT,
        coordinates::EXTRACTION_CONFIDENCE,
        coordinates::CREATED_AT,
        coordinates::TABLE,
        coordinates::MESSAGE_REF,
        coordinates::ID
    ))?;
    let rows = stmt.query_map(params![message_ref], map_coordinate)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Fetch one message by identity
pub fn get_message(
    conn: &Connection,
    channel_id: i64,
    message_id: i64,
) -> Result<Option<StoredMessage>> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1 AND {} = ?2",
                messages::SELECT_COLUMNS,
                messages::TABLE,
                messages::CHANNEL_ID,
                messages::MESSAGE_ID
            ),
            params![channel_id, message_id],
            map_message,
        )
        .optional()?;
    Ok(message)
}

/// Stored rows for the given identities, keyed by message id
pub fn messages_by_id(
    conn: &Connection,
    channel_id: i64,
    message_ids: &[i64],
) -> Result<HashMap<i64, StoredMessage>> {
    let mut found = HashMap::with_capacity(message_ids.len());
    for chunk in message_ids.chunks(MAX_IN_CLAUSE) {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ? AND {} IN ({})",
            messages::SELECT_COLUMNS,
            messages::TABLE,
            messages::CHANNEL_ID,
            messages::MESSAGE_ID,
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let values = std::iter::once(channel_id).chain(chunk.iter().copied());
        let rows = stmt.query_map(params_from_iter(values), map_message)?;
        for row in rows {
            let message = row?;
            found.insert(message.message_id, message);
        }
    }
    Ok(found)
}

/// Insert a message row verbatim, preserving foreign timestamps.
///
/// Used by imports, where `processed_at`/`last_updated` come from the
/// exporting device. Returns the new surrogate id.
pub fn insert_message_row(conn: &Connection, message: &StoredMessage) -> Result<i64> {
    let now = now_timestamp();
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            messages::TABLE,
            messages::CHANNEL_ID,
            messages::MESSAGE_ID,
            messages::MESSAGE_TEXT,
            messages::MESSAGE_DATE,
            messages::MEDIA_TYPE,
            messages::HAS_COORDINATES,
            messages::PROCESSED_AT,
            messages::LAST_UPDATED
        ),
        params![
            message.channel_id,
            message.message_id,
            message.text,
            message.date.as_ref().map(format_timestamp),
            message.media_type.as_str(),
            message.has_coordinates,
            message.processed_at.as_ref().map_or_else(|| now.clone(), format_timestamp),
            message.last_updated.as_ref().map_or_else(|| now.clone(), format_timestamp),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite every mutable field of a stored row, keeping its surrogate id
pub fn update_message_row(conn: &Connection, message: &StoredMessage) -> Result<()> {
    let now = now_timestamp();
    conn.execute(
        &format!(
            "UPDATE {} SET {} = ?2, {} = ?3, {} = ?4, {} = ?5, {} = ?6, {} = ?7 WHERE {} = ?1",
            messages::TABLE,
            messages::MESSAGE_TEXT,
            messages::MESSAGE_DATE,
            messages::MEDIA_TYPE,
            messages::HAS_COORDINATES,
            messages::PROCESSED_AT,
            messages::LAST_UPDATED,
            messages::ID
        ),
        params![
            message.id,
            message.text,
            message.date.as_ref().map(format_timestamp),
            message.media_type.as_str(),
            message.has_coordinates,
            message.processed_at.as_ref().map_or_else(|| now.clone(), format_timestamp),
            message.last_updated.as_ref().map_or_else(|| now.clone(), format_timestamp),
        ],
    )?;
    Ok(())
}

/// Attach links to a message; already-known URLs are ignored
pub fn insert_links(conn: &Connection, message_ref: i64, links: &[MessageLink]) -> Result<usize> {
    let now = now_timestamp();
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT OR IGNORE INTO {} ({}, {}, {}, {}, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        message_links::TABLE,
        message_links::MESSAGE_REF,
        message_links::URL,
        message_links::DOMAIN,
        message_links::CATEGORY
    ))?;
    let mut inserted = 0;
    for link in links {
        inserted += stmt.execute(params![
            message_ref,
            link.url,
            link.domain,
            link.category.as_str(),
            now,
        ])?;
    }
    Ok(inserted)
}

/// Links attached to a message
pub fn links_for_message(conn: &Connection, message_ref: i64) -> Result<Vec<MessageLink>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {}, {}, {} FROM {} WHERE {} = ?1 ORDER BY id",
        message_links::URL,
        message_links::DOMAIN,
        message_links::CATEGORY,
        message_links::TABLE,
        message_links::MESSAGE_REF
    ))?;
    let rows = stmt.query_map(params![message_ref], |row| {
        let category: String = row.get(2)?;
        Ok(MessageLink {
            url: row.get(0)?,
            domain: row.get(1)?,
            category: match category.as_str() {
                "telegram" => LinkCategory::Telegram,
                "video" => LinkCategory::Video,
                "government" => LinkCategory::Government,
                _ => LinkCategory::External,
            },
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::merge::CHANNEL_INGEST_RULES;
    use crate::models::ChannelFields;

    fn record(message_id: i64, text: &str) -> MessageRecord {
        MessageRecord {
            message_id,
            text: text.to_string(),
            date: None,
            media_type: MediaKind::Text,
            has_coordinates: false,
        }
    }

    #[test]
    fn reinsert_keeps_surrogate_and_processed_at() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        db.upsert_channel(1, &ChannelFields::default(), &CHANNEL_INGEST_RULES).unwrap();

        let first = db.bulk_insert_messages(1, &[record(5, "a"), record(6, "b")]).unwrap();
        let before = db.get_message(1, 5).unwrap().unwrap();
        let second = db.bulk_insert_messages(1, &[record(5, "edited")]).unwrap();
        let after = db.get_message(1, 5).unwrap().unwrap();

        assert_eq!(first[&5], second[&5]);
        assert_eq!(after.text, "edited");
        assert_eq!(before.processed_at, after.processed_at);
        assert!(after.last_updated >= before.last_updated);
        assert_eq!(
            db.bulk_check_existence(1, &[5, 6, 7]).unwrap(),
            HashSet::from([5, 6])
        );
        assert!(db.message_exists(1, 6).unwrap());
        assert!(!db.message_exists(2, 6).unwrap());
    }

    #[test]
    fn unchanged_reinsert_does_not_touch_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        db.upsert_channel(1, &ChannelFields::default(), &CHANNEL_INGEST_RULES).unwrap();
        db.bulk_insert_messages(1, &[record(5, "same")]).unwrap();
        let before = db.get_message(1, 5).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.bulk_insert_messages(1, &[record(5, "same")]).unwrap();
        let after = db.get_message(1, 5).unwrap().unwrap();
        assert_eq!(before.last_updated, after.last_updated);
    }

    #[test]
    fn links_are_unique_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        db.upsert_channel(1, &ChannelFields::default(), &CHANNEL_INGEST_RULES).unwrap();
        let refs = db.bulk_insert_messages(1, &[record(5, "x")]).unwrap();
        let link = MessageLink {
            url: "https://t.me/somewhere".into(),
            domain: Some("t.me".into()),
            category: LinkCategory::Telegram,
        };
        let conn = db.get_connection().unwrap();
        assert_eq!(insert_links(&conn, refs[&5], &[link.clone(), link.clone()]).unwrap(), 1);
        assert_eq!(insert_links(&conn, refs[&5], &[link]).unwrap(), 0);
        assert_eq!(db.links_for_message(refs[&5]).unwrap().len(), 1);
    }
}
