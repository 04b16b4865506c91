//! Message sources.
//!
//! The ingestion pipeline consumes messages through [`MessageSource`]. Two
//! implementations ship with the crate: [`JsonExportSource`] reads Telegram
//! Desktop `result.json` exports and [`StaticSource`] serves messages held in
//! memory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{ChannelInfo, ChannelType, ForwardOrigin, PeerKind};

/// Attachment descriptor as reported by the source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MediaDescriptor {
    /// Text-only message
    #[default]
    None,
    /// Photo
    Photo,
    /// Video, animation or video note
    Video,
    /// File attachment with an optional MIME type
    Document {
        /// Declared MIME type
        mime_type: Option<String>,
    },
    /// Anything else, by source-specific name
    Other(String),
}

/// One message as delivered by a source
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Externally assigned id, increasing within a channel
    pub id: i64,
    /// Text, possibly empty
    pub text: String,
    /// Publish time
    pub date: Option<DateTime<Utc>>,
    /// Attachment descriptor
    pub media: MediaDescriptor,
    /// Origin of a forwarded message
    pub forwarded_from: Option<ForwardOrigin>,
}

impl RawMessage {
    /// Plain text message with no attachment
    #[must_use]
    pub fn text(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            date: None,
            media: MediaDescriptor::None,
            forwarded_from: None,
        }
    }
}

/// Parameters of one batch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Only messages with a greater id
    pub after_id: Option<i64>,
    /// Only messages published at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Maximum batch size
    pub limit: usize,
}

/// Asynchronous, batch-producing supplier of channel messages.
///
/// Batches are oldest-first; an empty batch means the channel is exhausted.
/// Network and timeout failures should be reported as
/// [`Error::TransientSource`] so the pipeline retries them.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Resolve a user-facing reference (username, link, path) to a channel
    async fn resolve_channel(&self, reference: &str) -> Result<ChannelInfo>;

    /// Next batch of messages for `channel`
    async fn fetch_batch(&self, channel: &ChannelInfo, request: &FetchRequest) -> Result<Vec<RawMessage>>;
}

fn select_batch(messages: &[RawMessage], request: &FetchRequest) -> Vec<RawMessage> {
    messages
        .iter()
        .filter(|m| request.after_id.map_or(true, |after| m.id > after))
        .filter(|m| match (request.since, m.date) {
            (Some(since), Some(date)) => date >= since,
            _ => true,
        })
        .take(request.limit)
        .cloned()
        .collect()
}

// ---- Telegram Desktop JSON exports ---------------------------------------

#[derive(Debug, Deserialize)]
struct ExportFile {
    id: i64,
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportText {
    Plain(String),
    Rich(Vec<TextPart>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextPart {
    Plain(String),
    Entity { text: String },
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    id: i64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    date: Option<String>,
    date_unixtime: Option<String>,
    text: Option<ExportText>,
    media_type: Option<String>,
    photo: Option<String>,
    file: Option<String>,
    mime_type: Option<String>,
    forwarded_from: Option<String>,
    forwarded_from_id: Option<String>,
}

impl ExportText {
    fn flatten(self) -> String {
        match self {
            Self::Plain(text) => text,
            Self::Rich(parts) => parts
                .into_iter()
                .map(|part| match part {
                    TextPart::Plain(text) | TextPart::Entity { text } => text,
                })
                .collect(),
        }
    }
}

fn export_channel_type(kind: Option<&str>) -> Option<ChannelType> {
    match kind? {
        "public_channel" | "private_channel" => Some(ChannelType::Channel),
        "public_supergroup" | "private_supergroup" => Some(ChannelType::Supergroup),
        "private_group" => Some(ChannelType::Group),
        _ => None,
    }
}

fn export_media(message: &ExportMessage) -> MediaDescriptor {
    if message.photo.is_some() {
        return MediaDescriptor::Photo;
    }
    match message.media_type.as_deref() {
        Some("video_file" | "animation" | "video_message") => MediaDescriptor::Video,
        Some(_) | None if message.file.is_some() || message.mime_type.is_some() => {
            MediaDescriptor::Document {
                mime_type: message.mime_type.clone(),
            }
        }
        Some(other) => MediaDescriptor::Other(other.to_string()),
        None => MediaDescriptor::None,
    }
}

/// Parse `channel123`, `chat123` or `user123` into a forward origin
#[must_use]
pub fn parse_forward_origin(id: &str, title: Option<&str>) -> Option<ForwardOrigin> {
    let (kind, digits) = if let Some(rest) = id.strip_prefix("channel") {
        (PeerKind::Channel, rest)
    } else if let Some(rest) = id.strip_prefix("chat") {
        (PeerKind::Chat, rest)
    } else if let Some(rest) = id.strip_prefix("user") {
        (PeerKind::User, rest)
    } else {
        (PeerKind::Unknown, id)
    };
    Some(ForwardOrigin {
        kind,
        id: digits.trim().parse().ok()?,
        title: title.map(str::to_string),
        username: None,
    })
}

fn export_date(message: &ExportMessage) -> Option<DateTime<Utc>> {
    if let Some(unix) = message.date_unixtime.as_deref().and_then(|s| s.parse::<i64>().ok()) {
        return DateTime::from_timestamp(unix, 0);
    }
    let raw = message.date.as_deref()?;
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Convert one export entry; `Ok(None)` for service entries
fn convert_export_message(value: serde_json::Value) -> Result<Option<RawMessage>> {
    let message: ExportMessage = serde_json::from_value(value)
        .map_err(|e| Error::MalformedRecord(format!("unreadable export message: {e}")))?;
    if message.kind.as_deref().is_some_and(|kind| kind != "message") {
        return Ok(None);
    }
    let media = export_media(&message);
    let date = export_date(&message);
    let forwarded_from = message
        .forwarded_from_id
        .as_deref()
        .and_then(|id| parse_forward_origin(id, message.forwarded_from.as_deref()));
    Ok(Some(RawMessage {
        id: message.id,
        text: message.text.map(ExportText::flatten).unwrap_or_default(),
        date,
        media,
        forwarded_from,
    }))
}

/// Reads Telegram Desktop `result.json` exports; the channel reference is
/// the path of the export file.
#[derive(Debug, Default)]
pub struct JsonExportSource {
    loaded: Mutex<HashMap<i64, Vec<RawMessage>>>,
}

impl JsonExportSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageSource for JsonExportSource {
    async fn resolve_channel(&self, reference: &str) -> Result<ChannelInfo> {
        let path = PathBuf::from(reference);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut => {
                Error::TransientSource(format!("{}: {e}", path.display()))
            }
            _ => Error::Source(format!("Cannot read export {}: {e}", path.display())),
        })?;
        let export: ExportFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Source(format!("{} is not a channel export: {e}", path.display())))?;

        let mut messages = Vec::with_capacity(export.messages.len());
        let mut skipped = 0usize;
        for value in export.messages {
            match convert_export_message(value) {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => {}
                Err(err) => {
                    skipped += 1;
                    debug!(error = %err, "Skipping export entry");
                }
            }
        }
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        info!(
            channel_id = export.id,
            messages = messages.len(),
            skipped,
            "Loaded channel export"
        );

        let info = ChannelInfo {
            id: export.id,
            username: None,
            title: export.name,
            channel_type: export_channel_type(export.kind.as_deref()),
        };
        self.loaded
            .lock()
            .map_err(|_| Error::Other("export cache poisoned".into()))?
            .insert(info.id, messages);
        Ok(info)
    }

    async fn fetch_batch(&self, channel: &ChannelInfo, request: &FetchRequest) -> Result<Vec<RawMessage>> {
        let loaded = self
            .loaded
            .lock()
            .map_err(|_| Error::Other("export cache poisoned".into()))?;
        let messages = loaded
            .get(&channel.id)
            .ok_or_else(|| Error::Source(format!("Channel {} was not resolved", channel.id)))?;
        Ok(select_batch(messages, request))
    }
}

// ---- in-memory source ------------------------------------------------------

/// Serves fixed messages per reference; useful for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticSource {
    channels: HashMap<String, (ChannelInfo, Vec<RawMessage>)>,
    transient_failures: AtomicU32,
    fetch_calls: AtomicUsize,
}

impl StaticSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under `reference`
    #[must_use]
    pub fn with_channel(mut self, reference: &str, info: ChannelInfo, mut messages: Vec<RawMessage>) -> Self {
        messages.sort_by_key(|m| m.id);
        self.channels.insert(reference.to_string(), (info, messages));
        self
    }

    /// Fail the next `count` fetches with a transient error
    #[must_use]
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Number of `fetch_batch` calls served so far, failures included
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for StaticSource {
    async fn resolve_channel(&self, reference: &str) -> Result<ChannelInfo> {
        self.channels
            .get(reference)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| Error::Source(format!("Unknown channel reference '{reference}'")))
    }

    async fn fetch_batch(&self, channel: &ChannelInfo, request: &FetchRequest) -> Result<Vec<RawMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::TransientSource("simulated timeout".into()));
        }
        let messages = self
            .channels
            .values()
            .find(|(info, _)| info.id == channel.id)
            .map(|(_, messages)| messages.as_slice())
            .unwrap_or_default();
        Ok(select_batch(messages, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXPORT: &str = r#"{
        "name": "Grid Watch",
        "type": "public_channel",
        "id": 1001,
        "messages": [
            {"id": 12, "type": "message", "date": "2024-01-02T10:00:00", "date_unixtime": "1704189600",
             "text": [{"type": "bold", "text": "Seen "}, "near 40.730610, -73.935242"]},
            {"id": 10, "type": "message", "date": "2024-01-01T09:00:00", "text": "hello",
             "photo": "photos/1.jpg"},
            {"id": 11, "type": "service", "action": "pin_message", "text": ""},
            {"id": "bad", "type": "message", "text": "broken"},
            {"id": 13, "type": "message", "text": "fwd", "forwarded_from": "Other",
             "forwarded_from_id": "channel1234567890", "file": "clip.mp4",
             "media_type": "video_file", "mime_type": "video/mp4"}
        ]
    }"#;

    #[tokio::test]
    async fn reads_desktop_exports() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXPORT.as_bytes()).unwrap();
        let source = JsonExportSource::new();
        let info = source
            .resolve_channel(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(info.id, 1001);
        assert_eq!(info.channel_type, Some(ChannelType::Channel));

        let request = FetchRequest { after_id: None, since: None, limit: 10 };
        let batch = source.fetch_batch(&info, &request).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![10, 12, 13]);
        assert_eq!(batch[0].media, MediaDescriptor::Photo);
        assert_eq!(batch[1].text, "Seen near 40.730610, -73.935242");
        assert_eq!(batch[1].date, DateTime::from_timestamp(1_704_189_600, 0));
        assert_eq!(batch[2].media, MediaDescriptor::Video);
        let origin = batch[2].forwarded_from.as_ref().unwrap();
        assert_eq!((origin.kind, origin.id), (PeerKind::Channel, 1_234_567_890));

        let tail = FetchRequest { after_id: Some(10), since: None, limit: 1 };
        let batch = source.fetch_batch(&info, &tail).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 12);
    }

    #[tokio::test]
    async fn missing_export_is_a_permanent_error() {
        let err = JsonExportSource::new()
            .resolve_channel("/nonexistent/result.json")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Source(_)));
    }

    #[test]
    fn forward_ids_carry_peer_kind() {
        assert_eq!(parse_forward_origin("user42", None).unwrap().kind, PeerKind::User);
        assert_eq!(parse_forward_origin("chat7", None).unwrap().kind, PeerKind::Chat);
        assert_eq!(parse_forward_origin("99", None).unwrap().kind, PeerKind::Unknown);
        assert!(parse_forward_origin("channelx", None).is_none());
    }
}
