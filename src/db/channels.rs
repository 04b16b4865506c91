//! Channel rows: upsert with merge rules, cached statistics, reset.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::Result;
use crate::merge::{merge_field, ChannelRules};
use crate::models::{density_percent, Channel, ChannelFields, ChannelType};
use crate::schema::{channels, messages};
use crate::utils::{format_timestamp, now_timestamp, parse_timestamp};

pub(crate) fn map_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let channel_type: Option<String> = row.get(3)?;
    let first_scraped: Option<String> = row.get(4)?;
    let last_scraped: Option<String> = row.get(5)?;
    let last_updated: Option<String> = row.get(11)?;
    Ok(Channel {
        id: row.get(0)?,
        username: row.get(1)?,
        title: row.get(2)?,
        channel_type: channel_type.as_deref().and_then(ChannelType::parse),
        first_scraped: first_scraped.as_deref().and_then(parse_timestamp),
        last_scraped: last_scraped.as_deref().and_then(parse_timestamp),
        total_messages: row.get(6)?,
        messages_with_coordinates: row.get(7)?,
        coordinate_density: row.get(8)?,
        is_active: row.get(9)?,
        notes: row.get(10)?,
        last_updated: last_updated.as_deref().and_then(parse_timestamp),
    })
}

/// Fetch one channel
pub fn get_channel(conn: &Connection, channel_id: i64) -> Result<Option<Channel>> {
    let channel = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                channels::SELECT_COLUMNS,
                channels::TABLE,
                channels::ID
            ),
            params![channel_id],
            map_channel,
        )
        .optional()?;
    Ok(channel)
}

/// All channels ordered by id
pub fn list_channels(conn: &Connection) -> Result<Vec<Channel>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY {}",
        channels::SELECT_COLUMNS,
        channels::TABLE,
        channels::ID
    ))?;
    let rows = stmt.query_map([], map_channel)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Insert a channel or merge `fields` into the stored row under `rules`.
///
/// Returns `true` when a new row was created. Writing is skipped entirely
/// when the merge changes nothing.
pub fn upsert_channel(
    conn: &Connection,
    channel_id: i64,
    fields: &ChannelFields,
    rules: &ChannelRules,
) -> Result<bool> {
    let Some(existing) = get_channel(conn, channel_id)? else {
        insert_channel(conn, channel_id, fields)?;
        debug!(channel_id, "Channel created");
        return Ok(true);
    };

    let merged = merge_channel(&existing, fields, rules);
    if merged == existing {
        return Ok(false);
    }
    write_channel(conn, &merged)?;
    Ok(false)
}

/// Apply `rules` to produce the merged row; `last_updated` is left as is.
#[must_use]
pub fn merge_channel(existing: &Channel, incoming: &ChannelFields, rules: &ChannelRules) -> Channel {
    let channel_type = merge_field(
        rules.descriptive,
        existing.channel_type.map(|t| t.as_str().to_string()),
        incoming.channel_type.map(|t| t.as_str().to_string()),
    );
    Channel {
        id: existing.id,
        username: merge_field(rules.descriptive, existing.username.clone(), incoming.username.clone()),
        title: merge_field(rules.descriptive, existing.title.clone(), incoming.title.clone()),
        channel_type: channel_type.as_deref().and_then(ChannelType::parse),
        first_scraped: merge_field(rules.first_scraped, existing.first_scraped, incoming.first_scraped),
        last_scraped: merge_field(rules.last_scraped, existing.last_scraped, incoming.last_scraped),
        total_messages: merge_field(
            rules.aggregates,
            Some(existing.total_messages),
            incoming.total_messages,
        )
        .unwrap_or(existing.total_messages),
        messages_with_coordinates: merge_field(
            rules.aggregates,
            Some(existing.messages_with_coordinates),
            incoming.messages_with_coordinates,
        )
        .unwrap_or(existing.messages_with_coordinates),
        coordinate_density: merge_field(
            rules.aggregates,
            Some(existing.coordinate_density),
            incoming.coordinate_density,
        )
        .unwrap_or(existing.coordinate_density),
        is_active: merge_field(rules.is_active, Some(existing.is_active), incoming.is_active)
            .unwrap_or(existing.is_active),
        notes: merge_field(rules.descriptive, existing.notes.clone(), incoming.notes.clone()),
        last_updated: existing.last_updated,
    }
}

fn insert_channel(conn: &Connection, channel_id: i64, fields: &ChannelFields) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            channels::TABLE,
            channels::SELECT_COLUMNS
        ),
        params![
            channel_id,
            fields.username,
            fields.title,
            fields.channel_type.map(ChannelType::as_str),
            fields.first_scraped.as_ref().map(format_timestamp),
            fields.last_scraped.as_ref().map(format_timestamp),
            fields.total_messages.unwrap_or(0),
            fields.messages_with_coordinates.unwrap_or(0),
            fields.coordinate_density.filter(|d| d.is_finite()).unwrap_or(0.0),
            fields.is_active.unwrap_or(true),
            fields.notes,
            now_timestamp(),
        ],
    )?;
    Ok(())
}

fn write_channel(conn: &Connection, channel: &Channel) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {} SET {} = ?2, {} = ?3, {} = ?4, {} = ?5, {} = ?6, {} = ?7, {} = ?8, \
             {} = ?9, {} = ?10, {} = ?11, {} = ?12 WHERE {} = ?1",
            channels::TABLE,
            channels::USERNAME,
            channels::TITLE,
            channels::CHANNEL_TYPE,
            channels::FIRST_SCRAPED,
            channels::LAST_SCRAPED,
            channels::TOTAL_MESSAGES,
            channels::MESSAGES_WITH_COORDINATES,
            channels::COORDINATE_DENSITY,
            channels::IS_ACTIVE,
            channels::NOTES,
            channels::LAST_UPDATED,
            channels::ID
        ),
        params![
            channel.id,
            channel.username,
            channel.title,
            channel.channel_type.map(ChannelType::as_str),
            channel.first_scraped.as_ref().map(format_timestamp),
            channel.last_scraped.as_ref().map(format_timestamp),
            channel.total_messages,
            channel.messages_with_coordinates,
            channel.coordinate_density,
            channel.is_active,
            channel.notes,
            now_timestamp(),
        ],
    )?;
    Ok(())
}

/// Make sure a channel row exists so messages can reference it.
///
/// Returns `true` when a bare row had to be created.
pub fn ensure_channel(conn: &Connection, channel_id: i64) -> Result<bool> {
    let inserted = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?1, ?2)",
            channels::TABLE,
            channels::ID,
            channels::LAST_UPDATED
        ),
        params![channel_id, now_timestamp()],
    )?;
    Ok(inserted > 0)
}

/// Recompute message count, coordinate-bearing count and density from the
/// message table. Safe to call repeatedly; an unchanged channel is not
/// rewritten.
pub fn recompute_channel_statistics(conn: &Connection, channel_id: i64) -> Result<Option<Channel>> {
    let Some(current) = get_channel(conn, channel_id)? else {
        return Ok(None);
    };
    let (total, with_coordinates): (i64, i64) = conn.query_row(
        &format!(
            "SELECT COUNT(*), COALESCE(SUM({hc}), 0) FROM {} WHERE {} = ?1",
            messages::TABLE,
            messages::CHANNEL_ID,
            hc = messages::HAS_COORDINATES,
        ),
        params![channel_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let density = density_percent(with_coordinates, total);

    if current.total_messages == total
        && current.messages_with_coordinates == with_coordinates
        && (current.coordinate_density - density).abs() < f64::EPSILON
    {
        return Ok(Some(current));
    }

    conn.execute(
        &format!(
            "UPDATE {} SET {} = ?2, {} = ?3, {} = ?4, {} = ?5 WHERE {} = ?1",
            channels::TABLE,
            channels::TOTAL_MESSAGES,
            channels::MESSAGES_WITH_COORDINATES,
            channels::COORDINATE_DENSITY,
            channels::LAST_UPDATED,
            channels::ID
        ),
        params![channel_id, total, with_coordinates, density, now_timestamp()],
    )?;
    debug!(channel_id, total, with_coordinates, density, "Channel statistics recomputed");
    get_channel(conn, channel_id)
}

/// Highest ingested message id of a channel
pub fn latest_message_id(conn: &Connection, channel_id: i64) -> Result<Option<i64>> {
    let latest = conn.query_row(
        &format!(
            "SELECT MAX({}) FROM {} WHERE {} = ?1",
            messages::MESSAGE_ID,
            messages::TABLE,
            messages::CHANNEL_ID
        ),
        params![channel_id],
        |row| row.get(0),
    )?;
    Ok(latest)
}

/// Delete a channel; messages, coordinates, links and forwards cascade.
pub fn reset_channel(conn: &Connection, channel_id: i64) -> Result<bool> {
    let deleted = conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?1", channels::TABLE, channels::ID),
        params![channel_id],
    )?;
    Ok(deleted > 0)
}
