//! Channel recommendations discovered through forwarded messages.
//!
//! The ingestion pipeline calls a [`RecommendationSink`] for every newly
//! stored forwarded message. [`StoreRecommendations`] keeps the resulting
//! forward graph and per-origin counters in the local store.

use chrono::Utc;
use tracing::debug;

use crate::db::{channels, recommendations, Database};
use crate::error::Result;
use crate::models::{ForwardOrigin, PeerKind, Recommendation};

/// Receives forward notifications from the ingestion pipeline
pub trait RecommendationSink: Send + Sync {
    /// Note that `forwarding_channel` forwarded a message from `origin`.
    ///
    /// Returns the origin's channel id when it became a new recommendation.
    fn process_forward(
        &self,
        forwarding_channel: i64,
        origin: &ForwardOrigin,
        has_coordinates: bool,
        message_ref: i64,
    ) -> Result<Option<i64>>;
}

/// Activity figures handed to a [`Scorer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelActivity {
    /// Recommended channel
    pub channel_id: i64,
    /// Forwards observed
    pub forward_count: i64,
    /// Forwards that carried coordinates
    pub coordinate_forward_count: i64,
    /// Distinct channels that forwarded from it
    pub discovered_from: usize,
}

/// Opaque recommendation scoring heuristic
pub trait Scorer: Send + Sync {
    /// Score for the given activity; higher is better
    fn score(&self, activity: &ChannelActivity) -> f64;
}

/// Whether a forward origin plausibly names a channel.
///
/// Users never do. Channel and chat peers always do. For peers of unknown
/// kind, ids whose magnitude is below `min_channel_id` are rejected.
#[must_use]
pub const fn is_channel_origin(origin: &ForwardOrigin, min_channel_id: i64) -> bool {
    match origin.kind {
        PeerKind::User => false,
        PeerKind::Channel | PeerKind::Chat => true,
        PeerKind::Unknown => origin.id.unsigned_abs() >= min_channel_id.unsigned_abs(),
    }
}

/// Recommendation sink persisting into the local store
pub struct StoreRecommendations {
    db: Database,
    min_channel_id: i64,
    scorer: Option<Box<dyn Scorer>>,
}

impl StoreRecommendations {
    #[must_use]
    pub fn new(db: Database, min_channel_id: i64) -> Self {
        Self {
            db,
            min_channel_id,
            scorer: None,
        }
    }

    /// Attach a scoring heuristic
    #[must_use]
    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

impl RecommendationSink for StoreRecommendations {
    fn process_forward(
        &self,
        forwarding_channel: i64,
        origin: &ForwardOrigin,
        has_coordinates: bool,
        message_ref: i64,
    ) -> Result<Option<i64>> {
        if !is_channel_origin(origin, self.min_channel_id) || origin.id == forwarding_channel {
            debug!(origin = origin.id, kind = ?origin.kind, "Forward origin is not a channel");
            return Ok(None);
        }

        self.db.with_transaction(|tx| {
            if channels::get_channel(tx, origin.id)?.is_some() {
                return Ok(None);
            }
            if !recommendations::record_forward(tx, message_ref, origin.id, forwarding_channel, has_coordinates)? {
                return Ok(None);
            }

            let existing = recommendations::get_recommendation(tx, origin.id)?;
            let is_new = existing.is_none();
            let mut rec = existing.unwrap_or_else(|| Recommendation {
                channel_id: origin.id,
                username: None,
                title: None,
                channel_type: None,
                first_seen: None,
                last_seen: None,
                discovered_from: Vec::new(),
                forward_count: 0,
                coordinate_forward_count: 0,
                recommendation_score: 0.0,
                user_status: "pending".to_string(),
                user_notes: None,
            });

            rec.forward_count += 1;
            if has_coordinates {
                rec.coordinate_forward_count += 1;
            }
            if !rec.discovered_from.contains(&forwarding_channel) {
                rec.discovered_from.push(forwarding_channel);
            }
            rec.username = rec.username.or_else(|| origin.username.clone());
            rec.title = rec.title.or_else(|| origin.title.clone());
            if rec.channel_type.is_none() {
                rec.channel_type = match origin.kind {
                    PeerKind::Chat => Some("group".to_string()),
                    _ => Some("channel".to_string()),
                };
            }
            rec.last_seen = Some(Utc::now());
            if let Some(scorer) = &self.scorer {
                rec.recommendation_score = scorer.score(&ChannelActivity {
                    channel_id: rec.channel_id,
                    forward_count: rec.forward_count,
                    coordinate_forward_count: rec.coordinate_forward_count,
                    discovered_from: rec.discovered_from.len(),
                });
            }
            recommendations::save_recommendation(tx, &rec)?;

            if is_new {
                debug!(channel_id = origin.id, from = forwarding_channel, "New recommended channel");
                Ok(Some(origin.id))
            } else {
                Ok(None)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::CHANNEL_INGEST_RULES;
    use crate::models::{ChannelFields, MediaKind, MessageRecord};

    fn origin(kind: PeerKind, id: i64) -> ForwardOrigin {
        ForwardOrigin { kind, id, title: Some("Origin".into()), username: None }
    }

    #[test]
    fn low_ids_of_unknown_kind_are_rejected() {
        let threshold = 1_000_000_000;
        assert!(!is_channel_origin(&origin(PeerKind::Unknown, 123_456), threshold));
        assert!(is_channel_origin(&origin(PeerKind::Unknown, 1_234_567_890), threshold));
        assert!(is_channel_origin(&origin(PeerKind::Unknown, -1_234_567_890), threshold));
        assert!(is_channel_origin(&origin(PeerKind::Channel, 123_456), threshold));
        assert!(is_channel_origin(&origin(PeerKind::Chat, 42), threshold));
        assert!(!is_channel_origin(&origin(PeerKind::User, 1_234_567_890), threshold));
    }

    struct CountScorer;

    impl Scorer for CountScorer {
        #[allow(clippy::cast_precision_loss)]
        fn score(&self, activity: &ChannelActivity) -> f64 {
            activity.coordinate_forward_count as f64
        }
    }

    #[test]
    fn forwards_accumulate_on_one_recommendation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        for channel in [1, 2] {
            db.upsert_channel(channel, &ChannelFields::default(), &CHANNEL_INGEST_RULES).unwrap();
        }
        let record = |id| MessageRecord {
            message_id: id,
            text: String::new(),
            date: None,
            media_type: MediaKind::Text,
            has_coordinates: false,
        };
        let refs_a = db.bulk_insert_messages(1, &[record(1), record(2)]).unwrap();
        let refs_b = db.bulk_insert_messages(2, &[record(1)]).unwrap();

        let sink = StoreRecommendations::new(db.clone(), 1_000_000_000).with_scorer(Box::new(CountScorer));
        let from = origin(PeerKind::Channel, 5_000_000_000);
        assert_eq!(sink.process_forward(1, &from, true, refs_a[&1]).unwrap(), Some(5_000_000_000));
        assert_eq!(sink.process_forward(1, &from, false, refs_a[&2]).unwrap(), None);
        assert_eq!(sink.process_forward(2, &from, true, refs_b[&1]).unwrap(), None);
        // Same message again is not counted twice
        assert_eq!(sink.process_forward(2, &from, true, refs_b[&1]).unwrap(), None);

        let conn = db.get_connection().unwrap();
        let rec = recommendations::get_recommendation(&conn, 5_000_000_000).unwrap().unwrap();
        assert_eq!(rec.forward_count, 3);
        assert_eq!(rec.coordinate_forward_count, 2);
        assert_eq!(rec.discovered_from, vec![1, 2]);
        assert!((rec.recommendation_score - 2.0).abs() < f64::EPSILON);
        assert_eq!(recommendations::forward_count(&conn).unwrap(), 3);

        // Tracked channels are never recommended
        let tracked = origin(PeerKind::Channel, 2);
        assert_eq!(sink.process_forward(1, &tracked, true, refs_a[&1]).unwrap(), None);
    }
}
