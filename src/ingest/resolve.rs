//! Resolve Google News redirect URLs to the real article URLs.
//!
//! Feed links arrive as `news.google.com/rss/articles/<payload>` redirects.
//! Older payloads embed the destination directly in a base64url-encoded
//! blob (tier 1, no network). Newer payloads are opaque and need the
//! remote unshortening service (tier 2). When both tiers fail the original
//! URL is returned unchanged; callers treat "unchanged" as "unresolved".

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use crate::ingest::types::Article;

const REDIRECT_HOST: &str = "news.google.com";

fn redirect_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^https?://news\.google\.com/rss/articles/(.+)").unwrap())
}

fn embedded_url_re() -> &'static regex::bytes::Regex {
    static RE: OnceCell<regex::bytes::Regex> = OnceCell::new();
    RE.get_or_init(|| regex::bytes::Regex::new(r#"https?://[^\s\x00-\x1f"<>]+"#).unwrap())
}

/// Result of a remote unshortening call.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecodedUrl {
    pub status: bool,
    pub decoded_url: Option<String>,
}

/// Seam for the external unshortening service; tests supply fakes and the
/// pipeline can run with [`NoopDecoder`] when no endpoint is configured.
#[async_trait::async_trait]
pub trait RedirectDecoder: Send + Sync {
    async fn decode(&self, url: &str) -> Result<DecodedUrl>;
}

/// Always reports failure; used when no decoder endpoint is configured.
pub struct NoopDecoder;

#[async_trait::async_trait]
impl RedirectDecoder for NoopDecoder {
    async fn decode(&self, _url: &str) -> Result<DecodedUrl> {
        Ok(DecodedUrl {
            status: false,
            decoded_url: None,
        })
    }
}

/// Remote unshortening client: `GET {endpoint}?url=<redirect url>` returns
/// `{"status": bool, "decoded_url": "..."}`.
pub struct UnshortenClient {
    endpoint: String,
    client: reqwest::Client,
}

impl UnshortenClient {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { endpoint, client }
    }
}

#[async_trait::async_trait]
impl RedirectDecoder for UnshortenClient {
    async fn decode(&self, url: &str) -> Result<DecodedUrl> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("url", url)])
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<DecodedUrl>().await?)
    }
}

/// Resolve one URL. Non-redirect URLs come back unchanged without any
/// network call; redirect URLs go through the tiered chain.
pub async fn resolve_url(url: &str, decoder: &dyn RedirectDecoder) -> String {
    let payload = match redirect_re().captures(url) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
        None => return url.to_string(),
    };

    // The payload may carry its own query string (e.g. ?oc=5).
    let payload = payload.split('?').next().unwrap_or_default();

    if let Some(decoded) = decode_embedded_url(payload) {
        return decoded;
    }

    if let Some(decoded) = resolve_via_decoder(url, decoder).await {
        return decoded;
    }

    warn!(url = %truncate(url, 80), "could not resolve redirect URL");
    url.to_string()
}

/// Resolve every redirect URL in a batch. Articles whose URL changed keep
/// the original under `original_feed_url`; no-op resolutions are left
/// untouched.
pub async fn resolve_all(articles: &mut [Article], decoder: &dyn RedirectDecoder) {
    let mut resolved_count = 0usize;
    let mut failed_count = 0usize;

    for article in articles.iter_mut() {
        if !redirect_re().is_match(&article.url) {
            continue;
        }
        let resolved = resolve_url(&article.url, decoder).await;
        if resolved != article.url {
            article.original_feed_url = Some(std::mem::replace(&mut article.url, resolved));
            resolved_count += 1;
        } else {
            failed_count += 1;
        }
    }

    info!(
        resolved = resolved_count,
        failed = failed_count,
        "redirect resolution finished"
    );
}

/// Tier 1: decode the base64url payload and scan the raw bytes for an
/// embedded destination URL. Works for older-format redirect links where
/// the target is carried verbatim inside the payload.
fn decode_embedded_url(payload: &str) -> Option<String> {
    let stripped = payload.trim_end_matches('=');
    let raw = match URL_SAFE_NO_PAD.decode(stripped) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "base64 payload decode failed");
            return None;
        }
    };

    for m in embedded_url_re().find_iter(&raw) {
        let candidate = String::from_utf8_lossy(m.as_bytes()).into_owned();
        if candidate.contains(REDIRECT_HOST) {
            continue;
        }
        if let Ok(parsed) = Url::parse(&candidate) {
            if parsed.has_host() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Tier 2: ask the remote unshortening service. Failures are swallowed;
/// resolution is never fatal to the pipeline.
async fn resolve_via_decoder(url: &str, decoder: &dyn RedirectDecoder) -> Option<String> {
    match decoder.decode(url).await {
        Ok(result) => {
            if result.status {
                if let Some(decoded) = result.decoded_url {
                    if !decoded.contains(REDIRECT_HOST) {
                        return Some(decoded);
                    }
                }
            }
            None
        }
        Err(e) => {
            debug!(url = %truncate(url, 60), error = %e, "remote decode failed");
            None
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;

    fn redirect_for(target: &str) -> String {
        // Older-format payload: opaque framing bytes around the target URL.
        let mut blob = vec![0x08u8, 0x13, 0x22];
        blob.extend_from_slice(target.as_bytes());
        blob.extend_from_slice(&[0x01, 0x00]);
        format!(
            "https://news.google.com/rss/articles/{}?oc=5",
            URL_SAFE.encode(blob)
        )
    }

    #[tokio::test]
    async fn non_redirect_urls_pass_through_untouched() {
        let url = "https://example.com/story";
        assert_eq!(resolve_url(url, &NoopDecoder).await, url);
    }

    #[tokio::test]
    async fn embedded_payload_decodes_without_network() {
        let url = redirect_for("https://city-paper.example/rezoning-vote");
        let out = resolve_url(&url, &NoopDecoder).await;
        assert_eq!(out, "https://city-paper.example/rezoning-vote");
    }

    #[tokio::test]
    async fn payload_pointing_back_at_redirect_host_is_rejected() {
        let url = redirect_for("https://news.google.com/whatever");
        // Tier 1 rejects the self-referential target, tier 2 is a no-op,
        // so the original comes back unchanged.
        assert_eq!(resolve_url(&url, &NoopDecoder).await, url);
    }

    struct FixedDecoder(&'static str);

    #[async_trait::async_trait]
    impl RedirectDecoder for FixedDecoder {
        async fn decode(&self, _url: &str) -> Result<DecodedUrl> {
            Ok(DecodedUrl {
                status: true,
                decoded_url: Some(self.0.to_string()),
            })
        }
    }

    #[tokio::test]
    async fn remote_decoder_is_used_when_payload_is_opaque() {
        let url = "https://news.google.com/rss/articles/CBMiX25vdC1hLXVybA";
        let out = resolve_url(url, &FixedDecoder("https://paper.example/story")).await;
        assert_eq!(out, "https://paper.example/story");
    }

    #[tokio::test]
    async fn resolve_all_preserves_original_url_on_change() {
        let mut articles = vec![Article {
            title: "t".into(),
            snippet: String::new(),
            url: redirect_for("https://paper.example/a"),
            published: None,
            source: "s".into(),
            keyword: "k".into(),
            original_feed_url: None,
        }];
        let before = articles[0].url.clone();
        resolve_all(&mut articles, &NoopDecoder).await;
        assert_eq!(articles[0].url, "https://paper.example/a");
        assert_eq!(articles[0].original_feed_url.as_deref(), Some(before.as_str()));
    }
}
