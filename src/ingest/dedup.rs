//! Two-pass article deduplication.
//!
//! Pass 1 collapses on a canonical form of the resolved URL. Pass 2
//! collapses on the lowercased title: redirect resolution can fail for one
//! of two links pointing at the same story, so URL identity alone is not
//! enough. Both passes keep the first occurrence and preserve order.

use std::collections::HashSet;

use tracing::debug;
use url::form_urlencoded;
use url::Url;

use crate::ingest::types::Article;

/// Query parameters that only carry click tracking, stripped before URLs
/// are compared.
const TRACKING_PARAMS: &[&str] = &[
    "oc",
    "ved",
    "usg",
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
];

/// Normalize a URL into a deduplication key: scheme + lowercased host +
/// path without trailing slashes + tracking-free query sorted by key.
/// Never stored back onto the article. Unparseable URLs key as themselves.
pub fn canonical_url(raw: &str) -> String {
    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };

    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let path = parsed.path().trim_end_matches('/');

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    if pairs.is_empty() {
        format!("{}://{}{}", parsed.scheme(), host, path)
    } else {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        format!("{}://{}{}?{}", parsed.scheme(), host, path, query)
    }
}

/// Collapse a raw article list to unique stories. Stable, O(n).
pub fn dedup_articles(articles: Vec<Article>) -> Vec<Article> {
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut by_url = Vec::with_capacity(articles.len());
    for article in articles {
        if seen_urls.insert(canonical_url(&article.url)) {
            by_url.push(article);
        }
    }

    let mut seen_titles: HashSet<String> = HashSet::new();
    let mut by_title = Vec::with_capacity(by_url.len());
    for article in by_url {
        let title_key = article.title.trim().to_lowercase();
        if seen_titles.insert(title_key) {
            by_title.push(article);
        } else {
            debug!(title = %article.title, "title dedup removed duplicate");
        }
    }
    by_title
}
