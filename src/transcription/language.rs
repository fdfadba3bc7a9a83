//! # Languages
//!
//! A request's language is encoded in the Host header the device connects to:
//! `en-us.speech.example.net` means US English. The set of languages the service
//! can recognize comes from a model catalog fetched once at startup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// Identifier of a recognition language, e.g. `en-us`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Everything before the first `.` of the Host header.
    ///
    /// A host without dots (`localhost:8080`) is used whole; it will simply not
    /// match any catalog entry.
    pub fn from_host(host: &str) -> Self {
        let label = host.split('.').next().unwrap_or(host);
        Self(label.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the supported language set.
#[async_trait]
pub trait LanguageCatalog: Send + Sync {
    async fn fetch(&self) -> Result<HashSet<LanguageTag>>;
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    lang: String,
}

/// Parse a catalog document: a JSON array of objects with at least a `lang` field.
///
/// The same language usually appears several times (one entry per model size);
/// duplicates collapse.
pub fn parse_catalog(json: &str) -> Result<HashSet<LanguageTag>> {
    let entries: Vec<CatalogEntry> =
        serde_json::from_str(json).context("Model catalog is not a list of {\"lang\": ...} entries")?;
    Ok(entries.into_iter().map(|e| LanguageTag(e.lang)).collect())
}

/// Catalog published over HTTP (the Vosk model list).
pub struct HttpLanguageCatalog {
    url: String,
    client: reqwest::Client,
}

impl HttpLanguageCatalog {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for model catalog")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl LanguageCatalog for HttpLanguageCatalog {
    async fn fetch(&self) -> Result<HashSet<LanguageTag>> {
        debug!(url = %self.url, "Fetching model catalog");

        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Model catalog request to {} failed", self.url))?
            .error_for_status()
            .context("Model catalog returned an error status")?
            .text()
            .await
            .context("Failed to read model catalog body")?;

        let languages = parse_catalog(&body)?;
        info!(count = languages.len(), "Model catalog loaded");
        Ok(languages)
    }
}
