//! Backup, vacuum, store statistics and the import audit trail.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, DatabaseName};
use tracing::info;

use crate::error::Result;
use crate::models::{DatabaseStatistics, ImportHistoryEntry};
use crate::schema::{channels, coordinates, import_history, messages};
use crate::utils::{now_timestamp, parse_timestamp};

/// `<dir>/<file name>.backup_YYYYmmdd_HHMMSS`, next to the store when `dir`
/// is `None`
#[must_use]
pub fn timestamped_backup_path(store: &Path, dir: Option<&Path>) -> PathBuf {
    let file_name = store
        .file_name()
        .map_or_else(|| "store.db".to_string(), |n| n.to_string_lossy().into_owned());
    let name = format!("{file_name}.backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    match dir {
        Some(dir) => dir.join(name),
        None => store.with_file_name(name),
    }
}

/// Copy the store with SQLite's online backup API
pub fn backup_to(conn: &Connection, destination: &Path) -> Result<PathBuf> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    conn.backup(DatabaseName::Main, destination, None)?;
    info!(path = %destination.display(), "Store backed up");
    Ok(destination.to_path_buf())
}

/// Rebuild the database file, reclaiming free pages
pub fn vacuum(conn: &Connection) -> Result<()> {
    conn.execute_batch("VACUUM")?;
    info!("Store vacuumed");
    Ok(())
}

/// Store-wide figures
pub fn statistics(conn: &Connection) -> Result<DatabaseStatistics> {
    let count = |table: &str| -> Result<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    };
    let total_messages = count(messages::TABLE)?;
    let total_coordinates = count(coordinates::TABLE)?;

    let (tracked, active, average, last_scrape): (i64, i64, Option<f64>, Option<String>) = conn
        .query_row(
            &format!(
                "SELECT COUNT(*), COALESCE(SUM({active}), 0),
                        AVG(CASE WHEN {total} > 0 THEN {density} END), MAX({last})
                 FROM {t}",
                active = channels::IS_ACTIVE,
                total = channels::TOTAL_MESSAGES,
                density = channels::COORDINATE_DENSITY,
                last = channels::LAST_SCRAPED,
                t = channels::TABLE,
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    Ok(DatabaseStatistics {
        total_messages,
        total_coordinates,
        tracked_channels: tracked,
        active_channels: active,
        average_density: average.map_or(0.0, |d| (d * 100.0).round() / 100.0),
        last_scrape: last_scrape.as_deref().and_then(parse_timestamp),
    })
}

/// Append to the import audit trail
pub fn log_import(conn: &Connection, entry: &ImportHistoryEntry) -> Result<i64> {
    conn.execute(
        &format!(
            "INSERT INTO {} (imported_at, source_file, source_device, import_type, strategy, \
             stats, status, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            import_history::TABLE
        ),
        params![
            now_timestamp(),
            entry.source_file,
            entry.source_device,
            entry.import_type,
            entry.strategy,
            serde_json::to_string(&entry.stats)?,
            entry.status,
            entry.error,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Most recent import audit entries first
pub fn import_history(conn: &Connection, limit: usize) -> Result<Vec<ImportHistoryEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT source_file, source_device, import_type, strategy, stats, status, error
         FROM {} ORDER BY id DESC LIMIT ?1",
        import_history::TABLE
    ))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit], |row| {
        let stats: String = row.get(4)?;
        Ok(ImportHistoryEntry {
            source_file: row.get(0)?,
            source_device: row.get(1)?,
            import_type: row.get(2)?,
            strategy: row.get(3)?,
            stats: serde_json::from_str(&stats).unwrap_or(serde_json::Value::Null),
            status: row.get(5)?,
            error: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn backup_copies_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        db.set_metadata("marker", "present").unwrap();

        let backup = db.backup_timestamped(Some(&dir.path().join("backups"))).unwrap();
        assert!(backup.exists());
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("store.db.backup_"));

        let copy = Database::new(&backup).unwrap();
        assert_eq!(copy.get_metadata("marker").unwrap().as_deref(), Some("present"));
    }

    #[test]
    fn empty_store_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        let stats = db.statistics().unwrap();
        assert_eq!(stats, DatabaseStatistics::default());
        db.vacuum().unwrap();
    }
}
