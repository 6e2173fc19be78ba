//! Boundaries to the outside world: fetching a page and generating text.
//!
//! The workflow engine only sees [`Scraper`] and [`Generator`]. Each
//! implementation classifies its own failures into [`AdapterError`] so the
//! engine can decide between retrying and giving up.

pub mod command;
pub mod critique;
pub mod http_scraper;
pub mod noop;
pub mod openai;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("timed out")]
    Timeout,
    #[error("bad output: {0}")]
    BadOutput(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl AdapterError {
    /// Timeouts, unusable output, and transient failures are worth another
    /// attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// What a scrape returns. `snapshot_ref` is an opaque handle to the captured
/// page (a raw HTML snapshot path for [`http_scraper::HttpScraper`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapedPage {
    pub content: String,
    pub title: String,
    pub metadata: BTreeMap<String, String>,
    pub snapshot_ref: Option<String>,
}

#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, url: &Url) -> Result<ScrapedPage, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    Draft,
    Spin,
    Review,
    Summarize,
}

impl GenerationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Spin => "spin",
            Self::Review => "review",
            Self::Summarize => "summarize",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key/value context handed to the generator alongside the input text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationContext {
    entries: BTreeMap<String, String>,
}

impl GenerationContext {
    pub const TITLE: &'static str = "title";
    pub const SOURCE_URL: &'static str = "source_url";
    pub const THEMES: &'static str = "themes";
    pub const INSTRUCTIONS: &'static str = "instructions";
    pub const ORIGINAL: &'static str = "original";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if !value.trim().is_empty() {
            self.entries.insert(key.to_owned(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Text generator. Every implementation must handle all four
/// [`GenerationMode`]s.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        mode: GenerationMode,
        input: &str,
        context: &GenerationContext,
    ) -> Result<String, AdapterError>;
}

/// Rejects empty generator output.
pub fn non_empty(output: String) -> Result<String, AdapterError> {
    if output.trim().is_empty() {
        return Err(AdapterError::BadOutput("empty response".to_owned()));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_drops_blank_values() {
        let ctx = GenerationContext::new()
            .with(GenerationContext::TITLE, "Chapter 1")
            .with(GenerationContext::INSTRUCTIONS, "   ");
        assert_eq!(ctx.get(GenerationContext::TITLE), Some("Chapter 1"));
        assert_eq!(ctx.get(GenerationContext::INSTRUCTIONS), None);
    }

    #[test]
    fn only_fatal_errors_are_final() {
        assert!(AdapterError::Timeout.is_retryable());
        assert!(AdapterError::BadOutput("x".into()).is_retryable());
        assert!(AdapterError::Transient("503".into()).is_retryable());
        assert!(!AdapterError::Fatal("401".into()).is_retryable());
        assert!(non_empty(" \n".to_owned()).is_err());
    }
}
