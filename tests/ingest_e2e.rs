// tests/ingest_e2e.rs
// Ingest pipeline end to end against fixture feeds: redirect resolution,
// cross-keyword deduplication, keyword fault isolation, sort + cap.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{Duration, Utc};

use gnews_triage::ingest::resolve::NoopDecoder;
use gnews_triage::ingest::types::{FeedTransport, FetchError};
use gnews_triage::ingest::{fetch_all_articles, IngestConfig};
use gnews_triage::RetryPolicy;

/// Redirect link whose payload embeds `target` the way older feed links do.
fn redirect_link(target: &str) -> String {
    let mut blob = vec![0x08u8, 0x13, 0x22];
    blob.extend_from_slice(target.as_bytes());
    blob.extend_from_slice(&[0x01, 0x00]);
    format!(
        "https://news.google.com/rss/articles/{}?oc=5",
        URL_SAFE.encode(blob)
    )
}

fn feed_xml(items: &[(String, String, String)]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<rss version=\"2.0\"><channel><title>fixture</title>",
    );
    for (title, link, pub_date) in items {
        xml.push_str(&format!(
            "<item><title>{title}</title><link>{link}</link><pubDate>{pub_date}</pubDate><description>d</description></item>"
        ));
    }
    xml.push_str("</channel></rss>");
    xml
}

/// Serves a fixture per keyword fragment; unknown keywords get a parse
/// error (non-transient, so no retry sleeps in tests).
struct FixtureTransport {
    feeds: Vec<(&'static str, String)>,
}

#[async_trait::async_trait]
impl FeedTransport for FixtureTransport {
    async fn fetch(&self, feed_url: &str) -> Result<String, FetchError> {
        for (fragment, xml) in &self.feeds {
            if feed_url.contains(fragment) {
                return Ok(xml.clone());
            }
        }
        Err(FetchError::Parse("no fixture for url".to_string()))
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, std::time::Duration::from_millis(1), 2.0)
}

fn recent(hours_ago: i64) -> String {
    (Utc::now() - Duration::hours(hours_ago)).to_rfc2822()
}

#[tokio::test]
async fn two_keywords_sharing_one_story_yield_one_article() {
    // Both keywords surface the same story; after resolution the URLs are
    // identical, so only the first survives.
    let target = "https://city-paper.example/vote";
    let transport = FixtureTransport {
        feeds: vec![
            (
                "alpha",
                feed_xml(&[(
                    "Council vote - City Paper".to_string(),
                    redirect_link(target),
                    recent(2),
                )]),
            ),
            (
                "beta",
                feed_xml(&[(
                    "Big council vote - City Paper".to_string(),
                    redirect_link(target),
                    recent(3),
                )]),
            ),
        ],
    };

    let articles = fetch_all_articles(
        &transport,
        &NoopDecoder,
        &["alpha".to_string(), "beta".to_string()],
        IngestConfig {
            lookback_days: 1,
            max_articles: 100,
        },
        &fast_retry(),
    )
    .await;

    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].url, target);
    assert!(articles[0].original_feed_url.is_some());
}

#[tokio::test]
async fn failing_keyword_never_aborts_the_others() {
    let transport = FixtureTransport {
        feeds: vec![(
            "good",
            feed_xml(&[(
                "Survivor - Paper".to_string(),
                "https://paper.example/survivor".to_string(),
                recent(1),
            )]),
        )],
    };

    let articles = fetch_all_articles(
        &transport,
        &NoopDecoder,
        &["broken".to_string(), "good".to_string()],
        IngestConfig {
            lookback_days: 1,
            max_articles: 100,
        },
        &fast_retry(),
    )
    .await;

    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].keyword, "good");
}

#[tokio::test]
async fn output_is_sorted_by_published_desc_and_capped() {
    let transport = FixtureTransport {
        feeds: vec![(
            "alpha",
            feed_xml(&[
                (
                    "older".to_string(),
                    "https://paper.example/older".to_string(),
                    recent(10),
                ),
                (
                    "newest".to_string(),
                    "https://paper.example/newest".to_string(),
                    recent(1),
                ),
                (
                    "middle".to_string(),
                    "https://paper.example/middle".to_string(),
                    recent(5),
                ),
            ]),
        )],
    };

    let articles = fetch_all_articles(
        &transport,
        &NoopDecoder,
        &["alpha".to_string()],
        IngestConfig {
            lookback_days: 1,
            max_articles: 2,
        },
        &fast_retry(),
    )
    .await;

    let titles: Vec<&str> = articles.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(titles, vec!["newest", "middle"]);
}
