// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One keyword-matched news item as it leaves ingestion. Immutable once
/// emitted; only the resolver rewrites `url` (keeping the original under
/// `original_feed_url`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub snippet: String,
    pub url: String,
    pub published: Option<DateTime<Utc>>,
    pub source: String,
    pub keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_feed_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: HTTP {0}")]
    Status(u16),

    #[error("feed parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Connection problems, timeouts, rate limits and server errors are
    /// worth retrying; a malformed feed body is not.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(_) => true,
            FetchError::Status(code) => *code == 429 || *code >= 500,
            FetchError::Parse(_) => false,
        }
    }
}

/// Transport seam for feed fetching, so tests can serve fixture XML.
#[async_trait::async_trait]
pub trait FeedTransport: Send + Sync {
    async fn fetch(&self, feed_url: &str) -> Result<String, FetchError>;
}
