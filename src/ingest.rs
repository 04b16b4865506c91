//! Ingestion pipeline: source batches in, messages and coordinates out.
//!
//! A run walks a list of channel references. Each channel is resolved,
//! fetched batch by batch from a [`MessageSource`] and written one batch per
//! transaction. Per batch the pipeline
//!
//! 1. checks which message ids are already stored (one round trip),
//! 2. extracts and validates coordinates and links outside the transaction,
//! 3. writes messages, new coordinates, links and channel statistics in a
//!    single transaction,
//! 4. reports newly stored forwards to the [`RecommendationSink`].
//!
//! Source failures are isolated to their channel. Store failures abort the
//! run, and the session is always finalized with its status.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::db::{channels, messages, Database};
use crate::error::{Error, Result};
use crate::extract::CoordinateExtractor;
use crate::links::LinkExtractor;
use crate::merge::CHANNEL_INGEST_RULES;
use crate::metrics;
use crate::models::{
    same_point, ChannelFields, ChannelInfo, CoordinateFormat, ForwardOrigin, MediaKind, MessageLink,
    MessageRecord, NewCoordinate, SessionStats, SessionStatus,
};
use crate::recommend::RecommendationSink;
use crate::retry::{retry_with_backoff, Cancellation};
use crate::source::{FetchRequest, MediaDescriptor, MessageSource, RawMessage};

/// Session type recorded for ingestion runs
pub const INGEST_SESSION_TYPE: &str = "ingest";

/// Tuning knobs for one pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    /// Messages requested per source call
    pub batch_size: usize,
    /// Leave already stored messages untouched instead of refreshing them
    pub skip_existing: bool,
    /// Start each channel after its highest stored message id
    pub resume: bool,
    /// Only fetch messages dated at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Extra attempts for transient source failures
    pub max_retries: u32,
    /// First back-off delay
    pub retry_base_delay_ms: u64,
    /// Try the structured pattern when the primary one finds nothing
    pub structured_fallback: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            skip_existing: false,
            resume: false,
            since: None,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            structured_fallback: true,
        }
    }
}

impl From<&IngestConfig> for IngestOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            skip_existing: config.skip_existing,
            resume: false,
            since: None,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            structured_fallback: config.structured_fallback,
        }
    }
}

/// Counters for one batch, a channel or a whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    /// Messages received from the source
    pub fetched: usize,
    /// Messages stored for the first time
    pub inserted: usize,
    /// Already stored messages that were refreshed
    pub updated: usize,
    /// Already stored messages left alone
    pub skipped: usize,
    /// Coordinates written
    pub coordinates: usize,
    /// Coordinates already stored for their message
    pub duplicate_coordinates: usize,
    /// Coordinate candidates that failed validation
    pub malformed: usize,
    /// Links written
    pub links: usize,
    /// Channels that became new recommendations
    pub recommendations: usize,
}

impl AddAssign for BatchStats {
    fn add_assign(&mut self, other: Self) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.coordinates += other.coordinates;
        self.duplicate_coordinates += other.duplicate_coordinates;
        self.malformed += other.malformed;
        self.links += other.links;
        self.recommendations += other.recommendations;
    }
}

/// How a channel's ingestion ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum ChannelOutcome {
    /// Source exhausted
    Completed,
    /// The source failed for this channel; the run moved on
    Failed(String),
    /// Cancelled while fetching or backing off
    Cancelled,
    /// A store failure; the run stops here
    Aborted(String),
}

/// Result of ingesting one channel reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    /// Reference as given by the caller
    pub reference: String,
    /// Resolved channel id
    pub channel_id: Option<i64>,
    /// Resolved title
    pub title: Option<String>,
    /// Committed batches
    pub batches: usize,
    /// Totals over the committed batches
    pub stats: BatchStats,
    /// How it ended
    pub outcome: ChannelOutcome,
}

impl ChannelReport {
    fn new(reference: &str) -> Self {
        Self {
            reference: reference.to_string(),
            channel_id: None,
            title: None,
            batches: 0,
            stats: BatchStats::default(),
            outcome: ChannelOutcome::Completed,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Session row written for this run
    pub session_id: i64,
    /// Final session status
    pub status: SessionStatus,
    /// Per-channel reports, in processing order
    pub channels: Vec<ChannelReport>,
    /// Totals over every channel
    pub totals: BatchStats,
    /// Reason for a failed status
    pub error: Option<String>,
}

impl RunReport {
    /// Channels whose source failed
    pub fn failed_channels(&self) -> impl Iterator<Item = &ChannelReport> {
        self.channels
            .iter()
            .filter(|c| matches!(c.outcome, ChannelOutcome::Failed(_)))
    }
}

/// Map a source media descriptor onto the stored media kind
#[must_use]
pub fn classify_media(media: &MediaDescriptor) -> MediaKind {
    match media {
        MediaDescriptor::None => MediaKind::Text,
        MediaDescriptor::Photo => MediaKind::Photo,
        MediaDescriptor::Video => MediaKind::Video,
        MediaDescriptor::Document { mime_type } => match mime_type.as_deref() {
            Some(mime) if mime.starts_with("image/") => MediaKind::Photo,
            Some(mime) if mime.starts_with("video/") => MediaKind::Video,
            _ => MediaKind::Other,
        },
        MediaDescriptor::Other(_) => MediaKind::Other,
    }
}

#[derive(Debug, Clone, Copy)]
struct ExtractedPoint {
    point: (f64, f64),
    format: CoordinateFormat,
    confidence: &'static str,
}

struct PreparedMessage {
    record: MessageRecord,
    points: Vec<ExtractedPoint>,
    links: Vec<MessageLink>,
    forwarded_from: Option<ForwardOrigin>,
    known: bool,
}

/// The blocking half of the pipeline; cheap to clone into a worker thread
#[derive(Clone)]
struct BatchWriter {
    db: Database,
    extractor: Arc<dyn CoordinateExtractor>,
    links: LinkExtractor,
    recommendations: Option<Arc<dyn RecommendationSink>>,
    skip_existing: bool,
    structured_fallback: bool,
}

impl BatchWriter {
    /// Valid, unique points of one text and the count of rejected candidates
    fn extract_points(&self, text: &str) -> (Vec<ExtractedPoint>, usize) {
        let mut candidates = self.extractor.extract(text);
        let mut confidence = "high";
        if candidates.is_empty() && self.structured_fallback {
            candidates = self.extractor.extract_structured(text);
            confidence = "medium";
        }

        let mut points: Vec<ExtractedPoint> = Vec::with_capacity(candidates.len());
        let mut malformed = 0;
        for candidate in candidates {
            match candidate.to_point() {
                Ok(point) => {
                    if !points.iter().any(|p| same_point(p.point, point)) {
                        points.push(ExtractedPoint {
                            point,
                            format: candidate.format,
                            confidence,
                        });
                    }
                }
                Err(err) => {
                    malformed += 1;
                    debug!(error = %err, "Skipping malformed coordinate");
                }
            }
        }
        (points, malformed)
    }

    fn write_batch(&self, channel: &ChannelInfo, batch: Vec<RawMessage>) -> Result<BatchStats> {
        let started = Instant::now();
        let mut stats = BatchStats {
            fetched: batch.len(),
            ..BatchStats::default()
        };

        // Last occurrence wins if the source repeats an id
        let by_id: BTreeMap<i64, RawMessage> = batch.into_iter().map(|m| (m.id, m)).collect();
        let ids: Vec<i64> = by_id.keys().copied().collect();
        let existing = messages::existing_message_refs(&*self.db.get_connection()?, channel.id, &ids)?;

        let mut prepared = Vec::with_capacity(by_id.len());
        for message in by_id.into_values() {
            let known = existing.contains_key(&message.id);
            if known && self.skip_existing {
                stats.skipped += 1;
                continue;
            }
            let (points, malformed) = self.extract_points(&message.text);
            stats.malformed += malformed;
            let links = self.links.extract(&message.text);
            prepared.push(PreparedMessage {
                record: MessageRecord {
                    message_id: message.id,
                    media_type: classify_media(&message.media),
                    has_coordinates: !points.is_empty(),
                    date: message.date,
                    text: message.text,
                },
                links,
                points,
                forwarded_from: message.forwarded_from,
                known,
            });
        }

        let fields = ChannelFields {
            last_scraped: Some(Utc::now()),
            ..ChannelFields::from(channel)
        };
        let forwards = self.db.with_transaction(|tx| {
            channels::upsert_channel(tx, channel.id, &fields, &CHANNEL_INGEST_RULES)?;
            let records: Vec<MessageRecord> = prepared.iter().map(|p| p.record.clone()).collect();
            let refs = messages::bulk_insert_messages(tx, channel.id, &records)?;

            let known_refs: Vec<i64> = prepared
                .iter()
                .filter(|p| p.known)
                .filter_map(|p| refs.get(&p.record.message_id).copied())
                .collect();
            let stored_points = messages::coordinate_points(tx, &known_refs)?;

            let mut rows = Vec::new();
            let mut forwards = Vec::new();
            for message in &prepared {
                let Some(&message_ref) = refs.get(&message.record.message_id) else {
                    continue;
                };
                if message.known {
                    stats.updated += 1;
                } else {
                    stats.inserted += 1;
                }

                let stored = stored_points.get(&message_ref).map_or(&[][..], Vec::as_slice);
                for extracted in &message.points {
                    if stored.iter().any(|&p| same_point(p, extracted.point)) {
                        stats.duplicate_coordinates += 1;
                        continue;
                    }
                    rows.push(NewCoordinate {
                        message_ref,
                        latitude: extracted.point.0,
                        longitude: extracted.point.1,
                        format: extracted.format,
                        confidence: Some(extracted.confidence.to_string()),
                    });
                }
                stats.links += messages::insert_links(tx, message_ref, &message.links)?;

                if !message.known {
                    if let Some(origin) = &message.forwarded_from {
                        forwards.push((message_ref, origin.clone(), message.record.has_coordinates));
                    }
                }
            }
            stats.coordinates += messages::bulk_insert_coordinates(tx, &rows)?;
            channels::recompute_channel_statistics(tx, channel.id)?;
            Ok(forwards)
        })?;

        if let Some(sink) = &self.recommendations {
            for (message_ref, origin, has_coordinates) in forwards {
                match sink.process_forward(channel.id, &origin, has_coordinates, message_ref) {
                    Ok(Some(recommended)) => {
                        stats.recommendations += 1;
                        info!(channel_id = recommended, from = channel.id, "New channel recommendation");
                    }
                    Ok(None) => {}
                    Err(err) => warn!(
                        channel_id = channel.id,
                        origin = origin.id,
                        error = %err,
                        "Failed to record forward"
                    ),
                }
            }
        }

        metrics::record_batch(
            stats.inserted,
            stats.skipped,
            stats.coordinates,
            stats.malformed,
            started.elapsed(),
        );
        Ok(stats)
    }
}

/// Drives a [`MessageSource`] into the local store
#[derive(Clone)]
pub struct IngestPipeline {
    source: Arc<dyn MessageSource>,
    writer: BatchWriter,
    options: IngestOptions,
}

impl IngestPipeline {
    /// Build a pipeline writing into `db`
    pub fn new(
        db: Database,
        source: Arc<dyn MessageSource>,
        extractor: Arc<dyn CoordinateExtractor>,
        options: IngestOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::Validation("batch size must be greater than zero".into()));
        }
        Ok(Self {
            source,
            writer: BatchWriter {
                db,
                extractor,
                links: LinkExtractor::new()?,
                recommendations: None,
                skip_existing: options.skip_existing,
                structured_fallback: options.structured_fallback,
            },
            options,
        })
    }

    /// Report newly stored forwards to `sink`
    #[must_use]
    pub fn with_recommendations(mut self, sink: Arc<dyn RecommendationSink>) -> Self {
        self.writer.recommendations = Some(sink);
        self
    }

    /// Options in effect
    #[must_use]
    pub const fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Write one batch in its own transaction.
    ///
    /// The write runs on the blocking pool, so it completes and commits even
    /// if the awaiting future is dropped.
    pub async fn process_batch(&self, channel: &ChannelInfo, batch: Vec<RawMessage>) -> Result<BatchStats> {
        let writer = self.writer.clone();
        let channel = channel.clone();
        tokio::task::spawn_blocking(move || writer.write_batch(&channel, batch))
            .await
            .map_err(|e| Error::Other(format!("Batch writer task failed: {e}")))?
    }

    /// Ingest every message of one channel reference.
    ///
    /// Never fails as a whole; the outcome is part of the report.
    pub async fn ingest_channel(&self, reference: &str, cancel: &Cancellation) -> ChannelReport {
        let mut report = ChannelReport::new(reference);
        match self.fetch_channel(reference, cancel, &mut report).await {
            Ok(()) => {
                info!(
                    reference,
                    channel_id = report.channel_id,
                    batches = report.batches,
                    inserted = report.stats.inserted,
                    coordinates = report.stats.coordinates,
                    "Channel ingested"
                );
            }
            Err(Error::Cancelled) => {
                warn!(reference, batches = report.batches, "Channel ingestion cancelled");
                report.outcome = ChannelOutcome::Cancelled;
            }
            Err(
                err @ (Error::Source(_)
                | Error::TransientSource(_)
                | Error::MalformedRecord(_)
                | Error::Validation(_)),
            ) => {
                warn!(reference, error = %err, "Channel ingestion failed, continuing with next channel");
                metrics::record_channel_failure(err.kind());
                report.outcome = ChannelOutcome::Failed(err.to_string());
            }
            Err(err) => {
                error!(reference, error = %err, "Store failure during ingestion");
                metrics::record_channel_failure(err.kind());
                report.outcome = ChannelOutcome::Aborted(err.to_string());
            }
        }
        report
    }

    async fn fetch_channel(&self, reference: &str, cancel: &Cancellation, report: &mut ChannelReport) -> Result<()> {
        let retries = self.options.max_retries;
        let base_delay = self.options.retry_base_delay_ms;

        let info = retry_with_backoff(retries, base_delay, cancel, || self.source.resolve_channel(reference)).await?;
        report.channel_id = Some(info.id);
        report.title.clone_from(&info.title);

        let db = &self.writer.db;
        let fields = ChannelFields {
            first_scraped: Some(Utc::now()),
            ..ChannelFields::from(&info)
        };
        if db.upsert_channel(info.id, &fields, &CHANNEL_INGEST_RULES)? {
            info!(channel_id = info.id, title = ?info.title, "Tracking new channel");
        }

        let mut after_id = if self.options.resume {
            db.latest_message_id(info.id)?
        } else {
            None
        };
        debug!(channel_id = info.id, ?after_id, "Fetching channel");

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let request = FetchRequest {
                after_id,
                since: self.options.since,
                limit: self.options.batch_size,
            };
            let batch =
                retry_with_backoff(retries, base_delay, cancel, || self.source.fetch_batch(&info, &request)).await?;
            let Some(last_id) = batch.iter().map(|m| m.id).max() else {
                break;
            };
            if after_id.is_some_and(|after| last_id <= after) {
                warn!(channel_id = info.id, last_id, "Source did not advance, stopping");
                break;
            }

            let stats = self.process_batch(&info, batch).await?;
            report.batches += 1;
            report.stats += stats;
            debug!(
                channel_id = info.id,
                last_id,
                inserted = stats.inserted,
                skipped = stats.skipped,
                coordinates = stats.coordinates,
                "Batch committed"
            );
            after_id = Some(last_id);
        }
        Ok(())
    }

    /// Ingest `references` in order inside one session.
    ///
    /// A source failure skips to the next channel. A store failure or a
    /// cancellation ends the run, and the session is finalized as failed.
    /// `Err` is returned only when the session itself cannot be written.
    pub async fn run(&self, references: &[String], cancel: &Cancellation) -> Result<RunReport> {
        let db = &self.writer.db;
        let session_id = db.start_session(INGEST_SESSION_TYPE)?;
        info!(session_id, channels = references.len(), "Ingestion run started");

        let mut channels = Vec::with_capacity(references.len());
        let mut totals = BatchStats::default();
        let mut failure = None;
        for reference in references {
            if cancel.is_cancelled() {
                failure = Some("cancelled".to_string());
                break;
            }
            let report = self.ingest_channel(reference, cancel).await;
            totals += report.stats;
            let stop = match &report.outcome {
                ChannelOutcome::Cancelled => Some("cancelled".to_string()),
                ChannelOutcome::Aborted(message) => Some(message.clone()),
                ChannelOutcome::Completed | ChannelOutcome::Failed(_) => None,
            };
            channels.push(report);
            if stop.is_some() {
                failure = stop;
                break;
            }
        }

        let stats = SessionStats {
            channels_scraped: channels.iter().filter_map(|c| c.channel_id).collect(),
            new_messages: as_count(totals.inserted),
            new_coordinates: as_count(totals.coordinates),
            skipped_messages: as_count(totals.skipped),
        };
        let status = if failure.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        db.end_session(session_id, &stats, status, failure.as_deref())?;
        info!(
            session_id,
            %status,
            inserted = totals.inserted,
            coordinates = totals.coordinates,
            skipped = totals.skipped,
            "Ingestion run finished"
        );

        Ok(RunReport {
            session_id,
            status,
            channels,
            totals,
            error: failure,
        })
    }
}

fn as_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
