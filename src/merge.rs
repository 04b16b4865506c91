//! Field-level merge rules.
//!
//! Each mergeable entity has a rule table that maps every mutable field to a
//! [`FieldRule`]. The store and the sync engine apply the same tables, so a
//! channel merged from a snapshot and one merged from a foreign store end up
//! identical.

use chrono::{DateTime, Utc};

/// How one field is reconciled when an incoming value meets an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    /// A present incoming value replaces the existing one
    Overwrite,
    /// Keep the greater of the two present values
    Max,
    /// Keep the smaller of the two present values
    Min,
    /// Keep the existing value unless it is absent or empty
    PreferExisting,
}

/// Whether a value counts as populated for merge purposes.
pub trait Presence {
    /// `false` for values that should be treated like null
    fn is_present(&self) -> bool;
}

impl Presence for String {
    fn is_present(&self) -> bool {
        !self.trim().is_empty()
    }
}

impl Presence for i64 {
    fn is_present(&self) -> bool {
        true
    }
}

impl Presence for f64 {
    fn is_present(&self) -> bool {
        self.is_finite()
    }
}

impl Presence for bool {
    fn is_present(&self) -> bool {
        true
    }
}

impl Presence for DateTime<Utc> {
    fn is_present(&self) -> bool {
        true
    }
}

impl<T: Presence> Presence for Option<T> {
    fn is_present(&self) -> bool {
        self.as_ref().is_some_and(Presence::is_present)
    }
}

/// Merge one field according to `rule`.
///
/// An absent incoming value never replaces a present existing value,
/// whatever the rule.
pub fn merge_field<T>(rule: FieldRule, existing: Option<T>, incoming: Option<T>) -> Option<T>
where
    T: Presence + PartialOrd,
{
    let existing = existing.filter(Presence::is_present);
    let incoming = incoming.filter(Presence::is_present);
    match (existing, incoming) {
        (None, incoming) => incoming,
        (existing, None) => existing,
        (Some(current), Some(candidate)) => Some(match rule {
            FieldRule::Overwrite => candidate,
            FieldRule::PreferExisting => current,
            FieldRule::Max => {
                if candidate > current {
                    candidate
                } else {
                    current
                }
            }
            FieldRule::Min => {
                if candidate < current {
                    candidate
                } else {
                    current
                }
            }
        }),
    }
}

/// Rule table for channel rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRules {
    /// Rule for `username`, `title`, `channel_type` and `notes`
    pub descriptive: FieldRule,
    /// Rule for `first_scraped`
    pub first_scraped: FieldRule,
    /// Rule for `last_scraped`
    pub last_scraped: FieldRule,
    /// Rule for the cached counters and density
    pub aggregates: FieldRule,
    /// Rule for `is_active`
    pub is_active: FieldRule,
}

/// Ingestion is authoritative for this device: fresh values replace old ones.
pub const CHANNEL_INGEST_RULES: ChannelRules = ChannelRules {
    descriptive: FieldRule::Overwrite,
    first_scraped: FieldRule::Min,
    last_scraped: FieldRule::Overwrite,
    aggregates: FieldRule::Overwrite,
    is_active: FieldRule::Overwrite,
};

/// Imports never lose information already held locally.
pub const CHANNEL_SYNC_RULES: ChannelRules = ChannelRules {
    descriptive: FieldRule::PreferExisting,
    first_scraped: FieldRule::Min,
    last_scraped: FieldRule::Max,
    aggregates: FieldRule::Max,
    is_active: FieldRule::PreferExisting,
};

/// Rule table applied to a message row once the merge strategy decides the
/// incoming row wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRules {
    /// Rule for text, date, media type and coordinate flag
    pub content: FieldRule,
    /// Rule for `processed_at`
    pub processed_at: FieldRule,
    /// Rule for `last_updated`
    pub last_updated: FieldRule,
}

/// Message update rules for imports
pub const MESSAGE_UPDATE_RULES: MessageRules = MessageRules {
    content: FieldRule::Overwrite,
    processed_at: FieldRule::PreferExisting,
    last_updated: FieldRule::Max,
};

/// Recommendations and sessions: incoming overwrites populated fields, the
/// existing value survives where incoming is absent.
pub const RECORD_IMPORT_RULE: FieldRule = FieldRule::Overwrite;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn absent_incoming_never_clears() {
        for rule in [FieldRule::Overwrite, FieldRule::Max, FieldRule::Min, FieldRule::PreferExisting] {
            assert_eq!(merge_field(rule, Some(5_i64), None), Some(5));
            assert_eq!(
                merge_field(rule, Some("name".to_string()), Some("  ".to_string())),
                Some("name".to_string())
            );
        }
    }

    #[test]
    fn prefer_existing_fills_empty_fields() {
        assert_eq!(
            merge_field(FieldRule::PreferExisting, Some(String::new()), Some("t".to_string())),
            Some("t".to_string())
        );
        assert_eq!(
            merge_field(FieldRule::PreferExisting, Some("a".to_string()), Some("b".to_string())),
            Some("a".to_string())
        );
    }

    #[test]
    fn non_finite_density_is_absent() {
        assert_eq!(merge_field(FieldRule::Max, Some(12.5), Some(f64::NAN)), Some(12.5));
    }

    proptest! {
        #[test]
        fn max_and_min_pick_the_extremes(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(merge_field(FieldRule::Max, Some(a), Some(b)), Some(a.max(b)));
            prop_assert_eq!(merge_field(FieldRule::Min, Some(a), Some(b)), Some(a.min(b)));
        }

        #[test]
        fn overwrite_takes_present_incoming(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(merge_field(FieldRule::Overwrite, Some(a), Some(b)), Some(b));
        }
    }
}
