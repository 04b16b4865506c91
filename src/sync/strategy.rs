//! Merge strategies for message conflicts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::utils::parse_timestamp;

/// Policy deciding whether an incoming message replaces a stored one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// The stored row always wins
    Conservative,
    /// The incoming row always wins
    Aggressive,
    /// The row with the strictly newer `last_updated` wins
    #[default]
    Smart,
}

impl MergeStrategy {
    /// Every strategy, in display order
    pub const ALL: [Self; 3] = [Self::Conservative, Self::Aggressive, Self::Smart];

    /// Lowercase name, as accepted by [`FromStr`]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Aggressive => "aggressive",
            Self::Smart => "smart",
        }
    }

    /// Whether the incoming row should overwrite the stored one.
    ///
    /// For [`MergeStrategy::Smart`] an incoming row without a timestamp never
    /// wins, and a stored row without one always loses to a timestamped
    /// incoming row.
    #[must_use]
    pub fn should_update(self, existing: Option<DateTime<Utc>>, incoming: Option<DateTime<Utc>>) -> bool {
        self.should_update_stamp(existing, incoming.map_or(IncomingStamp::Missing, IncomingStamp::At))
    }

    /// Like [`MergeStrategy::should_update`], but tells a missing incoming
    /// timestamp apart from one that is present and unparseable. Under
    /// [`MergeStrategy::Smart`] an unparseable incoming timestamp wins.
    #[must_use]
    pub fn should_update_stamp(self, existing: Option<DateTime<Utc>>, incoming: IncomingStamp) -> bool {
        match self {
            Self::Conservative => false,
            Self::Aggressive => true,
            Self::Smart => match (existing, incoming) {
                (_, IncomingStamp::Missing) => false,
                (_, IncomingStamp::Unparseable) | (None, IncomingStamp::At(_)) => true,
                (Some(existing), IncomingStamp::At(incoming)) => incoming > existing,
            },
        }
    }
}

/// `last_updated` of an incoming row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingStamp {
    /// Absent or blank
    Missing,
    /// Present but not a recognised timestamp
    Unparseable,
    /// Parsed instant
    At(DateTime<Utc>),
}

impl IncomingStamp {
    /// Classify a raw `last_updated` value
    #[must_use]
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim).filter(|value| !value.is_empty()) {
            None => Self::Missing,
            Some(value) => parse_timestamp(value).map_or(Self::Unparseable, Self::At),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "aggressive" => Ok(Self::Aggressive),
            "smart" => Ok(Self::Smart),
            other => Err(Error::Validation(format!(
                "Unknown merge strategy '{other}' (expected conservative, aggressive or smart)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(secs, 0).single()
    }

    #[test]
    fn nine_combinations() {
        // (existing, incoming): older, equal, newer
        let cases = [(at(150), at(100)), (at(100), at(100)), (at(100), at(150))];
        let expected = [
            (MergeStrategy::Conservative, [false, false, false]),
            (MergeStrategy::Aggressive, [true, true, true]),
            (MergeStrategy::Smart, [false, false, true]),
        ];
        for (strategy, outcomes) in expected {
            for ((existing, incoming), want) in cases.iter().zip(outcomes) {
                assert_eq!(
                    strategy.should_update(*existing, *incoming),
                    want,
                    "{strategy} existing={existing:?} incoming={incoming:?}"
                );
            }
        }
    }

    #[test]
    fn smart_handles_missing_timestamps() {
        assert!(!MergeStrategy::Smart.should_update(at(100), None));
        assert!(!MergeStrategy::Smart.should_update(None, None));
        assert!(MergeStrategy::Smart.should_update(None, at(1)));
    }

    #[test]
    fn smart_lets_unparseable_incoming_win() {
        let stamp = IncomingStamp::parse(Some("2024/03/01 00:05"));
        assert_eq!(stamp, IncomingStamp::Unparseable);
        assert!(MergeStrategy::Smart.should_update_stamp(at(100), stamp));
        assert!(!MergeStrategy::Conservative.should_update_stamp(at(100), stamp));
        assert_eq!(IncomingStamp::parse(Some("  ")), IncomingStamp::Missing);
        assert!(!MergeStrategy::Smart.should_update_stamp(None, IncomingStamp::parse(None)));
        assert_eq!(
            IncomingStamp::parse(Some("1970-01-01T00:01:40Z")),
            IncomingStamp::At(at(100).unwrap())
        );
    }

    #[test]
    fn parses_names_case_insensitively() {
        assert_eq!("Smart".parse::<MergeStrategy>().unwrap(), MergeStrategy::Smart);
        assert_eq!(" aggressive ".parse::<MergeStrategy>().unwrap(), MergeStrategy::Aggressive);
        for strategy in MergeStrategy::ALL {
            assert_eq!(strategy.to_string().parse::<MergeStrategy>().unwrap(), strategy);
        }
        assert!(matches!("newest".parse::<MergeStrategy>(), Err(Error::Validation(_))));
    }

    proptest! {
        #[test]
        fn smart_updates_iff_strictly_newer(existing in 0i64..4_000_000_000, incoming in 0i64..4_000_000_000) {
            prop_assert_eq!(
                MergeStrategy::Smart.should_update(at(existing), at(incoming)),
                incoming > existing
            );
        }
    }
}
