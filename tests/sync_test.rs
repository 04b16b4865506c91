//! Comprehensive unit tests for sync module (export, import, merge strategies)

use std::path::Path;

use channel_coords::db::Database;
use channel_coords::merge::CHANNEL_INGEST_RULES;
use channel_coords::models::{ChannelFields, CoordinateFormat, MediaKind, MessageRecord, NewCoordinate};
use channel_coords::sync::snapshot::{CoordinateRow, MessageRow};
use channel_coords::sync::{
    export_snapshot, export_to_file, import_path, ImportOptions, Importer, MergeStrategy, Snapshot,
};
use channel_coords::Error;
use tempfile::TempDir;

const T100: &str = "2024-03-01T00:01:40.000000Z";
const T150: &str = "2024-03-01T00:02:30.000000Z";

fn open_store(dir: &TempDir, name: &str) -> Database {
    Database::new(dir.path().join(name)).expect("Failed to create database")
}

fn message_row(channel_id: i64, message_id: i64, text: &str, last_updated: &str) -> MessageRow {
    MessageRow {
        id: None,
        channel_id,
        message_id,
        message_text: Some(text.to_string()),
        message_date: Some("2024-03-01T00:00:00.000000Z".to_string()),
        media_type: Some("text".to_string()),
        has_coordinates: Some(false),
        processed_at: Some(T100.to_string()),
        last_updated: Some(last_updated.to_string()),
    }
}

fn snapshot_with(device: &str, messages: Vec<MessageRow>) -> Snapshot {
    let mut snapshot = Snapshot::new(Some(device.to_string()), Some(2));
    snapshot.messages = messages;
    snapshot
}

fn import_snapshot(db: &Database, snapshot: &Snapshot, strategy: MergeStrategy, dry_run: bool) -> channel_coords::ImportStats {
    let options = ImportOptions {
        strategy,
        dry_run,
        backup: false,
        backup_dir: None,
    };
    Importer::new(db.clone(), options)
        .import_snapshot(snapshot, Path::new("memory.json"), channel_coords::sync::ImportSource::Snapshot)
        .expect("Failed to import snapshot")
}

/// Device A holds message 50 of channel 2002 last updated at T=100
fn device_a(dir: &TempDir) -> Database {
    let db = open_store(dir, "a.db");
    import_snapshot(
        &db,
        &snapshot_with("device-a", vec![message_row(2002, 50, "original text", T100)]),
        MergeStrategy::Smart,
        false,
    );
    db
}

fn stored_text(db: &Database, channel_id: i64, message_id: i64) -> String {
    db.get_message(channel_id, message_id)
        .expect("Failed to read message")
        .expect("Message missing")
        .text
}

#[test]
fn test_smart_import_takes_newer_message() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let incoming = snapshot_with("device-b", vec![message_row(2002, 50, "edited text", T150)]);

    let stats = import_snapshot(&db, &incoming, MergeStrategy::Smart, false);

    assert_eq!(stored_text(&db, 2002, 50), "edited text");
    assert_eq!(stats.messages_updated, 1);
    assert_eq!(stats.conflicts_resolved, 1);
    assert_eq!(stats.messages_imported, 0);
}

#[test]
fn test_conservative_import_keeps_local_message() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let before = db.get_message(2002, 50).expect("Failed to read message").expect("Message missing");
    let incoming = snapshot_with("device-b", vec![message_row(2002, 50, "edited text", T150)]);

    let stats = import_snapshot(&db, &incoming, MergeStrategy::Conservative, false);

    let after = db.get_message(2002, 50).expect("Failed to read message").expect("Message missing");
    assert_eq!(after, before);
    assert_eq!(stats.messages_skipped, 1);
    assert_eq!(stats.messages_updated, 0);
}

#[test]
fn test_smart_import_ignores_older_message() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open_store(&dir, "a.db");
    import_snapshot(
        &db,
        &snapshot_with("device-a", vec![message_row(2002, 50, "newer", T150)]),
        MergeStrategy::Smart,
        false,
    );

    let stale = snapshot_with("device-b", vec![message_row(2002, 50, "older", T100)]);
    let stats = import_snapshot(&db, &stale, MergeStrategy::Smart, false);
    assert_eq!(stored_text(&db, 2002, 50), "newer");
    assert_eq!(stats.messages_skipped, 1);

    let stats = import_snapshot(&db, &stale, MergeStrategy::Aggressive, false);
    assert_eq!(stored_text(&db, 2002, 50), "older");
    assert_eq!(stats.messages_updated, 1);
}

#[test]
fn test_update_keeps_surrogate_and_latest_timestamp() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let before = db.get_message(2002, 50).expect("Failed to read message").expect("Message missing");

    let incoming = snapshot_with("device-b", vec![message_row(2002, 50, "edited text", T150)]);
    import_snapshot(&db, &incoming, MergeStrategy::Smart, false);

    let after = db.get_message(2002, 50).expect("Failed to read message").expect("Message missing");
    assert_eq!(after.id, before.id);
    assert_eq!(after.processed_at, before.processed_at);
    assert_eq!(after.last_updated.map(|t| t.timestamp()), Some(1_709_251_350));
}

#[test]
fn test_dry_run_leaves_store_unchanged() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open_store(&dir, "local.db");
    let path = dir.path().join("incoming.json");
    snapshot_with("device-b", vec![message_row(7, 1, "a", T100), message_row(7, 2, "b", T100)])
        .write_to(&path, false)
        .expect("Failed to write snapshot");

    let stats = import_path(&db, &path, MergeStrategy::Smart, true).expect("Failed to run dry import");

    assert_eq!(stats.messages_imported, 2);
    assert_eq!(stats.channels_added, 1);
    assert!(db.get_channel(7).expect("Failed to read channel").is_none());
    assert_eq!(db.statistics().expect("Failed to read statistics").total_messages, 0);
    assert!(db.import_history(10).expect("Failed to read history").is_empty());
}

#[test]
fn test_dry_run_reports_same_stats_as_real_import() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let incoming = snapshot_with(
        "device-b",
        vec![message_row(2002, 50, "edited", T150), message_row(2002, 51, "new", T150)],
    );

    let dry = import_snapshot(&db, &incoming, MergeStrategy::Smart, true);
    let real = import_snapshot(&db, &incoming, MergeStrategy::Smart, false);
    assert_eq!(dry, real);
}

#[test]
fn test_coordinates_within_tolerance_are_not_duplicated() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open_store(&dir, "local.db");
    db.upsert_channel(9, &ChannelFields::default(), &CHANNEL_INGEST_RULES)
        .expect("Failed to create channel");
    let refs = db
        .bulk_insert_messages(
            9,
            &[MessageRecord {
                message_id: 1,
                text: "at 1.0, 2.0".to_string(),
                date: None,
                media_type: MediaKind::Text,
                has_coordinates: true,
            }],
        )
        .expect("Failed to insert message");
    db.bulk_insert_coordinates(&[NewCoordinate {
        message_ref: refs[&1],
        latitude: 1.0,
        longitude: 2.0,
        format: CoordinateFormat::Decimal,
        confidence: Some("high".to_string()),
    }])
    .expect("Failed to insert coordinate");

    let coordinate = |lat: f64, lon: f64| CoordinateRow {
        channel_id: 9,
        message_id: 1,
        latitude: lat,
        longitude: lon,
        coordinate_format: Some("decimal".to_string()),
        extraction_confidence: Some("high".to_string()),
        created_at: None,
    };
    let mut incoming = Snapshot::new(Some("device-b".to_string()), Some(2));
    incoming.coordinates = vec![
        coordinate(1.0 + 1e-12, 2.0),
        coordinate(3.0, 4.0),
        coordinate(3.0, 4.0 - 1e-12),
        coordinate(91.0, 4.0),
    ];

    let stats = import_snapshot(&db, &incoming, MergeStrategy::Smart, false);

    assert_eq!(stats.coordinates_imported, 1);
    assert_eq!(stats.coordinates_skipped, 2);
    assert_eq!(stats.malformed_rows, 1);
    assert_eq!(db.coordinates_for_message(refs[&1]).expect("Failed to read coordinates").len(), 2);
}

#[test]
fn test_round_trip_into_empty_store() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let source = open_store(&dir, "source.db");
    source
        .upsert_channel(
            1001,
            &ChannelFields {
                title: Some("Grid Watch".to_string()),
                ..ChannelFields::default()
            },
            &CHANNEL_INGEST_RULES,
        )
        .expect("Failed to create channel");
    let records: Vec<MessageRecord> = (10..13)
        .map(|id| MessageRecord {
            message_id: id,
            text: format!("message {id}"),
            date: None,
            media_type: MediaKind::Text,
            has_coordinates: id == 11,
        })
        .collect();
    let refs = source.bulk_insert_messages(1001, &records).expect("Failed to insert messages");
    source
        .bulk_insert_coordinates(&[NewCoordinate {
            message_ref: refs[&11],
            latitude: 40.730_610,
            longitude: -73.935_242,
            format: CoordinateFormat::Decimal,
            confidence: Some("high".to_string()),
        }])
        .expect("Failed to insert coordinate");
    source.recompute_channel_statistics(1001).expect("Failed to recompute");

    let summary = export_to_file(&source, &dir.path().join("snap.json"), None, true).expect("Failed to export");
    let target = open_store(&dir, "target.db");
    let stats = import_path(&target, &summary.path, MergeStrategy::Smart, false).expect("Failed to import");

    assert_eq!(stats.messages_imported, 3);
    assert_eq!(stats.coordinates_imported, 1);
    assert_eq!(stats.channels_added, 1);
    let source_stats = source.statistics().expect("Failed to read statistics");
    let target_stats = target.statistics().expect("Failed to read statistics");
    assert_eq!(target_stats.total_messages, source_stats.total_messages);
    assert_eq!(target_stats.total_coordinates, source_stats.total_coordinates);
    let channel = target.get_channel(1001).expect("Failed to read channel").expect("Channel missing");
    assert_eq!(channel.title.as_deref(), Some("Grid Watch"));
    assert!((channel.coordinate_density - 33.33).abs() < 1e-9);

    // A second import of the same snapshot changes nothing
    let again = import_path(&target, &summary.path, MergeStrategy::Smart, false).expect("Failed to import");
    assert_eq!(again.messages_imported, 0);
    assert_eq!(again.coordinates_imported, 0);
    assert_eq!(again.coordinates_skipped, 1);
    assert_eq!(target.statistics().expect("Failed to read statistics").total_coordinates, 1);

    let history = target.import_history(10).expect("Failed to read history");
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|entry| entry.status == "completed"));
}

#[test]
fn test_unsupported_extension_is_rejected_before_any_write() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open_store(&dir, "local.db");
    let path = dir.path().join("snapshot.txt");
    std::fs::write(&path, "{}").expect("Failed to write file");

    let result = import_path(&db, &path, MergeStrategy::Smart, false);

    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(db.import_history(10).expect("Failed to read history").is_empty());
    let backups = std::fs::read_dir(dir.path())
        .expect("Failed to list dir")
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains("backup"))
        .count();
    assert_eq!(backups, 0);
}

#[test]
fn test_invalid_snapshot_is_recorded_as_failed_import() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open_store(&dir, "local.db");
    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{"version": "2.0", "channels": []}"#).expect("Failed to write file");

    let result = import_path(&db, &path, MergeStrategy::Smart, false);

    assert!(matches!(result, Err(Error::Validation(_))));
    let history = db.import_history(10).expect("Failed to read history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "failed");
    assert!(history[0].error.is_some());
}

#[test]
fn test_malformed_rows_are_counted_not_fatal() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = open_store(&dir, "local.db");
    let path = dir.path().join("partial.json");
    std::fs::write(
        &path,
        r#"{
            "version": "2.0",
            "channels": [],
            "messages": [
                {"channel_id": 5, "message_id": 1, "message_text": "ok", "has_coordinates": 0},
                {"channel_id": 5, "message_id": "not-a-number"}
            ],
            "sessions": [
                {"device_id": "b", "session_start": "2024-01-02T00:00:00Z", "session_end": "2024-01-01T00:00:00Z"}
            ]
        }"#,
    )
    .expect("Failed to write file");

    let stats = import_path(&db, &path, MergeStrategy::Smart, false).expect("Failed to import");

    assert_eq!(stats.messages_imported, 1);
    assert_eq!(stats.malformed_rows, 2);
    assert_eq!(stats.sessions_merged, 0);
}

#[test]
fn test_direct_store_import() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let foreign = device_a(&dir);
    let local = open_store(&dir, "local.db");

    let dry = import_path(&local, foreign.path(), MergeStrategy::Smart, true).expect("Failed to dry-run import");
    assert_eq!(dry.messages_imported, 1);
    assert!(local.get_message(2002, 50).expect("Failed to read message").is_none());

    let stats = import_path(&local, foreign.path(), MergeStrategy::Smart, false).expect("Failed to import store");
    assert_eq!(stats.messages_imported, 1);
    assert_eq!(stored_text(&local, 2002, 50), "original text");

    let history = local.import_history(1).expect("Failed to read history");
    assert_eq!(history[0].import_type, "store");
}

#[test]
fn test_store_cannot_import_itself() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let result = import_path(&db, db.path(), MergeStrategy::Smart, false);
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[test]
fn test_incremental_export_only_carries_changes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let conn = db.get_connection().expect("Failed to get connection");

    let full = export_snapshot(&conn, None).expect("Failed to export");
    assert_eq!(full.messages.len(), 1);

    let watermark = chrono::Utc::now() + chrono::Duration::minutes(5);
    let incremental = export_snapshot(&conn, Some(&watermark)).expect("Failed to export");
    assert!(incremental.messages.is_empty());
    assert!(incremental.channels.is_empty());
}

#[test]
fn test_aggressive_import_writes_empty_text() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let incoming = snapshot_with("device-b", vec![message_row(2002, 50, "", T150)]);

    let stats = import_snapshot(&db, &incoming, MergeStrategy::Aggressive, false);

    assert_eq!(stats.messages_updated, 1);
    assert_eq!(stored_text(&db, 2002, 50), "");
}

#[test]
fn test_missing_incoming_text_keeps_stored_text() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let mut row = message_row(2002, 50, "unused", T150);
    row.message_text = None;

    import_snapshot(&db, &snapshot_with("device-b", vec![row]), MergeStrategy::Aggressive, false);

    assert_eq!(stored_text(&db, 2002, 50), "original text");
}

#[test]
fn test_smart_import_takes_row_with_unparseable_timestamp() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let incoming = snapshot_with("device-b", vec![message_row(2002, 50, "edited text", "2024/03/01 00:05")]);

    let stats = import_snapshot(&db, &incoming, MergeStrategy::Smart, false);

    assert_eq!(stats.messages_updated, 1);
    assert_eq!(stats.messages_skipped, 0);
    assert_eq!(stored_text(&db, 2002, 50), "edited text");
}

#[test]
fn test_smart_import_skips_row_with_blank_timestamp() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let incoming = snapshot_with("device-b", vec![message_row(2002, 50, "edited text", "")]);

    let stats = import_snapshot(&db, &incoming, MergeStrategy::Smart, false);

    assert_eq!(stats.messages_skipped, 1);
    assert_eq!(stored_text(&db, 2002, 50), "original text");
}

#[test]
fn test_real_import_backs_up_store_first() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let path = dir.path().join("incoming.json");
    snapshot_with("device-b", vec![message_row(2002, 50, "edited text", T150)])
        .write_to(&path, false)
        .expect("Failed to write snapshot");

    import_path(&db, &path, MergeStrategy::Smart, false).expect("Failed to import snapshot");

    let backups: Vec<_> = std::fs::read_dir(dir.path())
        .expect("Failed to list temp dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("a.db.backup_"))
        .collect();
    assert_eq!(backups.len(), 1, "backups: {backups:?}");

    let backup = Database::open_read_only(dir.path().join(&backups[0])).expect("Failed to open backup");
    assert_eq!(stored_text(&backup, 2002, 50), "original text");
    assert_eq!(stored_text(&db, 2002, 50), "edited text");
}

#[test]
fn test_failed_import_leaves_store_unchanged() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = device_a(&dir);
    let before = db.get_message(2002, 50).expect("Failed to read message").expect("Message missing");
    db.get_connection()
        .expect("Failed to get connection")
        .execute_batch(
            "CREATE TRIGGER reject_coordinates BEFORE INSERT ON coordinates \
             BEGIN SELECT RAISE(ABORT, 'boom'); END;",
        )
        .expect("Failed to install trigger");

    let mut incoming = snapshot_with(
        "device-b",
        vec![
            message_row(2002, 50, "edited text", T150),
            message_row(2002, 51, "Seen near 40.730610, -73.935242", T150),
        ],
    );
    incoming.coordinates = vec![CoordinateRow {
        channel_id: 2002,
        message_id: 51,
        latitude: 40.730_610,
        longitude: -73.935_242,
        coordinate_format: Some("decimal".to_string()),
        extraction_confidence: Some("high".to_string()),
        created_at: None,
    }];
    let options = ImportOptions {
        backup: false,
        ..ImportOptions::default()
    };

    let result = Importer::new(db.clone(), options).import_snapshot(
        &incoming,
        Path::new("incoming.json"),
        channel_coords::sync::ImportSource::Snapshot,
    );

    assert!(matches!(result, Err(Error::Database(_))));
    let after = db.get_message(2002, 50).expect("Failed to read message").expect("Message missing");
    assert_eq!(after, before);
    assert!(!db.message_exists(2002, 51).expect("Failed to check message"));

    let history = db.import_history(10).expect("Failed to read history");
    let failed: Vec<_> = history.iter().filter(|entry| entry.status == "failed").collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().is_some_and(|err| err.contains("boom")));
}
