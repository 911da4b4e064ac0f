// src/ingest/mod.rs
pub mod dedup;
pub mod gnews;
pub mod resolve;
pub mod types;

use chrono::Utc;
use tracing::{error, info};

use crate::ingest::resolve::RedirectDecoder;
use crate::ingest::types::{Article, FeedTransport, FetchError};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub lookback_days: u32,
    pub max_articles: usize,
}

/// Fetch every keyword's feed, resolve redirect URLs, deduplicate, and
/// return at most `max_articles` items sorted by published time
/// descending (undated items last).
///
/// A keyword that keeps failing is logged and skipped; it never aborts the
/// run for the remaining keywords.
pub async fn fetch_all_articles(
    transport: &dyn FeedTransport,
    decoder: &dyn RedirectDecoder,
    keywords: &[String],
    cfg: IngestConfig,
    retry: &RetryPolicy,
) -> Vec<Article> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(cfg.lookback_days));

    let mut raw: Vec<Article> = Vec::new();
    for keyword in keywords {
        let fetched = retry
            .run("keyword fetch", FetchError::is_transient, || {
                gnews::fetch_keyword(transport, keyword, cfg.lookback_days, cutoff)
            })
            .await;
        match fetched {
            Ok(mut articles) => raw.append(&mut articles),
            Err(e) => {
                error!(keyword, error = %e, "keyword fetch failed, skipping");
            }
        }
    }

    resolve::resolve_all(&mut raw, decoder).await;

    let mut unique = dedup::dedup_articles(raw);
    unique.sort_by(|a, b| b.published.cmp(&a.published));
    unique.truncate(cfg.max_articles);

    info!(
        articles = unique.len(),
        keywords = keywords.len(),
        cap = cfg.max_articles,
        "ingest finished"
    );
    unique
}
