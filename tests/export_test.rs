//! Comprehensive unit tests for file_writer.rs (coordinates CSV export)

use std::sync::Arc;

use channel_coords::db::Database;
use channel_coords::extract::RegexExtractor;
use channel_coords::file_writer::{coordinate_rows, export_coordinates_csv};
use channel_coords::ingest::{IngestOptions, IngestPipeline};
use channel_coords::models::{ChannelInfo, ChannelType};
use channel_coords::retry::Cancellation;
use channel_coords::source::{RawMessage, StaticSource};
use tempfile::tempdir;

async fn populated_store(dir: &std::path::Path) -> Database {
    let db = Database::new(dir.join("test.db")).expect("Failed to create database");
    let source = StaticSource::new()
        .with_channel(
            "public",
            ChannelInfo {
                id: 1001,
                username: Some("gridwatch".to_string()),
                title: Some("Grid Watch".to_string()),
                channel_type: Some(ChannelType::Channel),
            },
            vec![
                RawMessage::text(10, "Morning update"),
                RawMessage::text(11, "Seen near 40.730610, -73.935242"),
                RawMessage::text(12, "Two spots: 51.5074, -0.1278 and 48.8566, 2.3522"),
            ],
        )
        .with_channel(
            "private",
            ChannelInfo {
                id: 2002,
                username: None,
                title: Some("Closed Group".to_string()),
                channel_type: Some(ChannelType::Supergroup),
            },
            vec![RawMessage::text(50, "Meet at 35.6762, 139.6503")],
        );

    let pipeline = IngestPipeline::new(
        db.clone(),
        Arc::new(source),
        Arc::new(RegexExtractor::new().expect("Failed to build extractor")),
        IngestOptions::default(),
    )
    .expect("Failed to build pipeline");
    pipeline
        .run(&["public".to_string(), "private".to_string()], &Cancellation::new())
        .await
        .expect("Failed to run ingestion");
    db
}

#[tokio::test]
async fn test_export_all_coordinates() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let db = populated_store(temp_dir.path()).await;
    let output = temp_dir.path().join("out/coordinates.csv");

    let rows = export_coordinates_csv(&db, &output, None).expect("Failed to export CSV");
    assert_eq!(rows, 4);

    let mut reader = csv::Reader::from_path(&output).expect("Failed to open CSV");
    let headers = reader.headers().expect("Failed to read headers").clone();
    assert_eq!(&headers[0], "channel_id");
    assert_eq!(&headers[9], "message_link");

    let records: Vec<csv::StringRecord> = reader
        .records()
        .collect::<Result<_, _>>()
        .expect("Failed to read records");
    assert_eq!(records.len(), 4);
    assert_eq!(&records[0][2], "11");
    assert_eq!(&records[0][9], "https://t.me/gridwatch/11");
    // Message text with commas survives quoting
    assert_eq!(&records[1][8], "Two spots: 51.5074, -0.1278 and 48.8566, 2.3522");
    assert_eq!(&records[3][9], "https://t.me/c/2002/50");
}

#[tokio::test]
async fn test_export_single_channel() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let db = populated_store(temp_dir.path()).await;

    let conn = db.get_connection().expect("Failed to get connection");
    let rows = coordinate_rows(&conn, Some(2002)).expect("Failed to read rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].channel_title, "Closed Group");
    assert!((rows[0].latitude - 35.6762).abs() < 1e-9);
    assert!((rows[0].longitude - 139.6503).abs() < 1e-9);
    assert_eq!(rows[0].coordinate_format, "decimal");
    assert_eq!(rows[0].extraction_confidence, "high");

    assert!(coordinate_rows(&conn, Some(9999)).expect("Failed to read rows").is_empty());
}

#[test]
fn test_export_empty_store() {
    let temp_dir = tempdir().expect("Failed to create temp directory");
    let db = Database::new(temp_dir.path().join("test.db")).expect("Failed to create database");
    let output = temp_dir.path().join("empty.csv");

    assert_eq!(export_coordinates_csv(&db, &output, None).expect("Failed to export CSV"), 0);
    let content = std::fs::read_to_string(&output).expect("Failed to read CSV");
    assert_eq!(content.lines().count(), 1);
}
