use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::{Error, Result};
use crate::sync::ImportSource;

fn invalid(message: impl Into<String>) -> Error {
    Error::Validation(message.into())
}

/// Validation utilities for command input and edge case handling
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a channel reference: `@username`, a `t.me` link or an export file path
    pub fn validate_channel_reference(reference: &str) -> Result<()> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("Channel reference cannot be empty"));
        }

        if trimmed.len() > 4096 {
            return Err(invalid("Channel reference too long (max 4096 characters)"));
        }

        if trimmed.chars().any(char::is_control) {
            return Err(invalid("Channel reference contains invalid characters"));
        }

        if let Some(username) = trimmed.strip_prefix('@') {
            // Telegram usernames: 5-32 characters of [A-Za-z0-9_]
            if !(5..=32).contains(&username.len())
                || !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(invalid(format!("Invalid channel username: {trimmed}")));
            }
        }

        Ok(())
    }

    /// Validate a coordinate pair in decimal degrees
    pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<()> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(invalid("Coordinates must be finite numbers"));
        }

        if !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid(format!("Latitude {latitude} outside [-90, 90]")));
        }

        if !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid(format!("Longitude {longitude} outside [-180, 180]")));
        }

        Ok(())
    }

    /// Validate an output file path
    pub fn validate_file_path(path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        if path_str.trim().is_empty() {
            return Err(invalid("File path cannot be empty"));
        }

        if path_str.contains('\0') {
            return Err(invalid("File path contains invalid characters"));
        }

        if path_str.len() > 4096 {
            return Err(invalid("File path too long (max 4096 characters)"));
        }

        Ok(())
    }

    /// Validate a file to import: supported suffix and an existing, readable file
    pub fn validate_import_path(path: &Path) -> Result<ImportSource> {
        Self::validate_file_path(path)?;
        let source = ImportSource::from_path(path)?;

        if !path.is_file() {
            return Err(invalid(format!("Import file does not exist: {}", path.display())));
        }

        Ok(source)
    }

    /// Validate an ingestion or export watermark
    pub fn validate_since(since: &DateTime<Utc>) -> Result<()> {
        if *since > Utc::now() {
            return Err(invalid("Watermark cannot be in the future"));
        }

        // Telegram launched in 2013; anything older is almost certainly a typo
        let earliest = DateTime::from_timestamp(1_356_998_400, 0).unwrap_or_default();
        if *since < earliest {
            tracing::warn!(%since, "Watermark predates any possible message");
        }

        Ok(())
    }

    /// Validate batch size for ingestion
    pub fn validate_batch_size(batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(invalid("Batch size must be greater than 0"));
        }

        if batch_size > 10_000 {
            return Err(invalid("Batch size too large (max 10,000)"));
        }

        Ok(())
    }

    /// Sanitize text input
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }
}
