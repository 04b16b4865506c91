//! Outbound link extraction.
//!
//! Links are a side channel of ingestion: they are stored per message and do
//! not take part in coordinate extraction or sync merges.

use std::collections::HashSet;

use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{LinkCategory, MessageLink};

/// Finds, normalises and categorises URLs in message text
#[derive(Debug, Clone)]
pub struct LinkExtractor {
    pattern: Regex,
}

impl LinkExtractor {
    /// Compile the URL pattern
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(r"((?:https?://|www\.)[\w\-._~:/?#\[\]@!$&'()*+,;=%]+)")
            .map_err(|e| Error::Other(format!("Invalid URL pattern: {e}")))?;
        Ok(Self { pattern })
    }

    /// Unique links in text order
    #[must_use]
    pub fn extract(&self, text: &str) -> Vec<MessageLink> {
        let mut seen = HashSet::new();
        self.pattern
            .find_iter(text)
            .map(|m| normalize_url(m.as_str()))
            .filter(|url| seen.insert(url.clone()))
            .map(|url| {
                let domain = domain_of(&url);
                let category = domain.as_deref().map_or(LinkCategory::External, categorize);
                MessageLink { url, domain, category }
            })
            .collect()
    }
}

/// Trim trailing sentence punctuation and give scheme-less links `https://`
#[must_use]
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim_end_matches(['.', ',', ';', ':', '!', '?']);
    if trimmed.to_ascii_lowercase().starts_with("www.") {
        format!("https://{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Lowercased host of a normalised URL, without `www.` or a port
#[must_use]
pub fn domain_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest
        .split(['/', '?', '#'])
        .next()?
        .rsplit('@')
        .next()?
        .split(':')
        .next()?
        .to_ascii_lowercase();
    let host = host.strip_prefix("www.").map_or(host.clone(), str::to_string);
    (!host.is_empty()).then_some(host)
}

/// Category of a host
#[must_use]
pub fn categorize(domain: &str) -> LinkCategory {
    let matches = |suffix: &str| domain == suffix || domain.ends_with(&format!(".{suffix}"));
    if matches("t.me") || matches("telegram.me") {
        LinkCategory::Telegram
    } else if matches("youtube.com") || matches("youtu.be") {
        LinkCategory::Video
    } else if domain.ends_with(".gov") || domain.ends_with(".gov.uk") || domain.ends_with(".mil") {
        LinkCategory::Government
    } else {
        LinkCategory::External
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_categorises() {
        let links = LinkExtractor::new().unwrap().extract(
            "See https://t.me/somechannel/42, www.YouTube.com/watch?v=x and https://www.army.mil/news.",
        );
        let urls: Vec<_> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://t.me/somechannel/42",
                "https://www.YouTube.com/watch?v=x",
                "https://www.army.mil/news",
            ]
        );
        assert_eq!(links[0].category, LinkCategory::Telegram);
        assert_eq!(links[1].category, LinkCategory::Video);
        assert_eq!(links[1].domain.as_deref(), Some("youtube.com"));
        assert_eq!(links[2].category, LinkCategory::Government);
    }

    #[test]
    fn duplicates_are_dropped() {
        let links = LinkExtractor::new()
            .unwrap()
            .extract("https://example.org/a https://example.org/a");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].category, LinkCategory::External);
    }

    #[test]
    fn host_parsing_handles_ports_and_credentials() {
        assert_eq!(domain_of("https://user@Example.com:8080/x").as_deref(), Some("example.com"));
        assert_eq!(categorize("data.gov.uk"), LinkCategory::Government);
        assert_eq!(categorize("nottelegram.me.example"), LinkCategory::External);
    }
}
