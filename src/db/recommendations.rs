//! Recommended channels and the forward edges that produced them.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::Recommendation;
use crate::schema::{channel_forwards, recommended_channels};
use crate::utils::{format_timestamp, now_timestamp, parse_timestamp};

pub(crate) fn map_recommendation(row: &Row<'_>) -> rusqlite::Result<Recommendation> {
    let first_seen: Option<String> = row.get(4)?;
    let last_seen: Option<String> = row.get(5)?;
    let discovered: String = row.get(6)?;
    Ok(Recommendation {
        channel_id: row.get(0)?,
        username: row.get(1)?,
        title: row.get(2)?,
        channel_type: row.get(3)?,
        first_seen: first_seen.as_deref().and_then(parse_timestamp),
        last_seen: last_seen.as_deref().and_then(parse_timestamp),
        discovered_from: serde_json::from_str(&discovered).unwrap_or_default(),
        forward_count: row.get(7)?,
        coordinate_forward_count: row.get(8)?,
        recommendation_score: row.get(9)?,
        user_status: row.get(10)?,
        user_notes: row.get(11)?,
    })
}

/// Fetch one recommendation
pub fn get_recommendation(conn: &Connection, channel_id: i64) -> Result<Option<Recommendation>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                recommended_channels::SELECT_COLUMNS,
                recommended_channels::TABLE,
                recommended_channels::CHANNEL_ID
            ),
            params![channel_id],
            map_recommendation,
        )
        .optional()?;
    Ok(found)
}

/// All recommendations, best score first
pub fn list_recommendations(conn: &Connection) -> Result<Vec<Recommendation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY recommendation_score DESC, {}",
        recommended_channels::SELECT_COLUMNS,
        recommended_channels::TABLE,
        recommended_channels::CHANNEL_ID
    ))?;
    let rows = stmt.query_map([], map_recommendation)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Write a recommendation row in full, inserting or replacing by channel id
pub fn save_recommendation(conn: &Connection, rec: &Recommendation) -> Result<()> {
    let now = now_timestamp();
    conn.execute(
        &format!(
            "INSERT INTO {t} ({cols}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT({id}) DO UPDATE SET
                username = excluded.username, title = excluded.title,
                channel_type = excluded.channel_type, first_seen = excluded.first_seen,
                last_seen = excluded.last_seen,
                discovered_from_channels = excluded.discovered_from_channels,
                forward_count = excluded.forward_count,
                coordinate_forward_count = excluded.coordinate_forward_count,
                recommendation_score = excluded.recommendation_score,
                user_status = excluded.user_status, user_notes = excluded.user_notes",
            t = recommended_channels::TABLE,
            cols = recommended_channels::SELECT_COLUMNS,
            id = recommended_channels::CHANNEL_ID,
        ),
        params![
            rec.channel_id,
            rec.username,
            rec.title,
            rec.channel_type,
            rec.first_seen.as_ref().map_or_else(|| now.clone(), format_timestamp),
            rec.last_seen.as_ref().map_or_else(|| now.clone(), format_timestamp),
            serde_json::to_string(&rec.discovered_from)?,
            rec.forward_count,
            rec.coordinate_forward_count,
            rec.recommendation_score,
            rec.user_status,
            rec.user_notes,
        ],
    )?;
    Ok(())
}

/// Record a forward edge; returns `false` when the edge was already known
pub fn record_forward(
    conn: &Connection,
    message_ref: i64,
    from_channel_id: i64,
    to_channel_id: i64,
    had_coordinates: bool,
) -> Result<bool> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} (message_ref, from_channel_id, to_channel_id, forward_date, \
             had_coordinates) VALUES (?1, ?2, ?3, ?4, ?5)",
            channel_forwards::TABLE
        ),
        params![message_ref, from_channel_id, to_channel_id, now_timestamp(), had_coordinates],
    )?;
    Ok(inserted > 0)
}

/// Number of forward edges stored
pub fn forward_count(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", channel_forwards::TABLE),
        [],
        |row| row.get(0),
    )?)
}
