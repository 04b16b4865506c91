//! Coordinate extraction from free text.
//!
//! The pipeline depends only on [`CoordinateExtractor`]; [`RegexExtractor`]
//! is the default implementation. Decimal pairs (`40.730610, -73.935242`) are
//! the primary pattern; degrees/minutes/seconds with hemisphere letters
//! (`40°44'54.3"N 73°59'9.9"W`) are the structured fallback.

use regex::Regex;

use crate::error::{Error, Result};
use crate::models::CoordinateFormat;

/// A coordinate pair exactly as found in the text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCoordinate {
    /// Latitude text
    pub latitude: String,
    /// Longitude text
    pub longitude: String,
    /// Notation it was written in
    pub format: CoordinateFormat,
}

impl RawCoordinate {
    /// Parse into finite decimal degrees within the valid ranges
    pub fn to_point(&self) -> Result<(f64, f64)> {
        let parse = |raw: &str, axis: &str, limit: f64| -> Result<f64> {
            let value: f64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::MalformedRecord(format!("{axis} '{raw}' is not a number")))?;
            if !value.is_finite() || value.abs() > limit {
                return Err(Error::MalformedRecord(format!(
                    "{axis} {value} outside [-{limit}, {limit}]"
                )));
            }
            Ok(value)
        };
        Ok((
            parse(&self.latitude, "latitude", 90.0)?,
            parse(&self.longitude, "longitude", 180.0)?,
        ))
    }
}

/// Pure text-to-coordinates function used by the ingestion pipeline
pub trait CoordinateExtractor: Send + Sync {
    /// Every coordinate pair found by the primary pattern, in text order
    fn extract(&self, text: &str) -> Vec<RawCoordinate>;

    /// Secondary pass, consulted only when [`Self::extract`] finds nothing
    fn extract_structured(&self, _text: &str) -> Vec<RawCoordinate> {
        Vec::new()
    }
}

/// Regex-based extractor for decimal and DMS coordinates
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    decimal: Regex,
    dms: Regex,
}

impl RegexExtractor {
    /// Compile the coordinate patterns
    pub fn new() -> Result<Self> {
        let decimal = Regex::new(r"(-?\d+\.\d+),\s*(-?\d+\.\d+)")
            .map_err(|e| Error::Other(format!("Invalid decimal coordinate pattern: {e}")))?;
        let dms = Regex::new(
            r#"(?i)(\d+)[°\s](\d+)['′\s](\d+(?:\.\d+)?)["″]?\s*([NS])[\s,]+(\d+)[°\s](\d+)['′\s](\d+(?:\.\d+)?)["″]?\s*([EW])"#,
        )
        .map_err(|e| Error::Other(format!("Invalid DMS coordinate pattern: {e}")))?;
        Ok(Self { decimal, dms })
    }
}

impl CoordinateExtractor for RegexExtractor {
    fn extract(&self, text: &str) -> Vec<RawCoordinate> {
        self.decimal
            .captures_iter(text)
            .map(|caps| RawCoordinate {
                latitude: caps[1].to_string(),
                longitude: caps[2].to_string(),
                format: CoordinateFormat::Decimal,
            })
            .collect()
    }

    fn extract_structured(&self, text: &str) -> Vec<RawCoordinate> {
        self.dms
            .captures_iter(text)
            .filter_map(|caps| {
                let latitude = dms_to_decimal(&caps[1], &caps[2], &caps[3], &caps[4])?;
                let longitude = dms_to_decimal(&caps[5], &caps[6], &caps[7], &caps[8])?;
                Some(RawCoordinate {
                    latitude: latitude.to_string(),
                    longitude: longitude.to_string(),
                    format: CoordinateFormat::Dms,
                })
            })
            .collect()
    }
}

/// Convert degrees, minutes, seconds and a hemisphere letter to decimal
/// degrees; south and west are negative.
#[must_use]
pub fn dms_to_decimal(degrees: &str, minutes: &str, seconds: &str, hemisphere: &str) -> Option<f64> {
    let degrees: f64 = degrees.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    let value = degrees + minutes / 60.0 + seconds / 3600.0;
    match hemisphere.to_ascii_uppercase().as_str() {
        "S" | "W" => Some(-value),
        _ => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> RegexExtractor {
        RegexExtractor::new().unwrap()
    }

    #[test]
    fn finds_every_decimal_pair() {
        let found = extractor().extract("A 40.730610, -73.935242 and B 51.5,-0.12");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].latitude, "40.730610");
        assert_eq!(found[0].longitude, "-73.935242");
        assert_eq!(found[1].to_point().unwrap(), (51.5, -0.12));
    }

    #[test]
    fn plain_text_has_no_coordinates() {
        let e = extractor();
        assert!(e.extract("Nothing to see, 12 tanks").is_empty());
        assert!(e.extract_structured("Nothing to see").is_empty());
    }

    #[test]
    fn dms_fallback_converts_to_decimal() {
        let found = extractor().extract_structured(r#"Position 40°44'54.3"N 73°59'9.9"W"#);
        assert_eq!(found.len(), 1);
        let (lat, lon) = found[0].to_point().unwrap();
        assert!((lat - 40.748_416).abs() < 1e-5);
        assert!((lon + 73.986_083).abs() < 1e-5);
        assert_eq!(found[0].format, CoordinateFormat::Dms);
    }

    #[test]
    fn out_of_range_pairs_are_malformed() {
        let raw = RawCoordinate {
            latitude: "123.5".into(),
            longitude: "10.0".into(),
            format: CoordinateFormat::Decimal,
        };
        assert!(matches!(raw.to_point(), Err(Error::MalformedRecord(_))));
    }
}
