//! Google News RSS: keyword search URL construction and feed parsing.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::ingest::types::{Article, FeedTransport, FetchError};

const SEARCH_URL: &str = "https://news.google.com/rss/search";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; GnewsTriage/1.0)";
const FETCH_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    source: Option<Source>,
}

#[derive(Debug, Deserialize)]
struct Source {
    #[serde(rename = "$text")]
    name: Option<String>,
}

/// Build the keyword search feed URL. The lookback window rides inside the
/// query (`when:<days>d`) so the feed itself pre-filters old items.
pub fn feed_url(keyword: &str, lookback_days: u32) -> String {
    let mut url = Url::parse(SEARCH_URL).expect("static search url");
    url.query_pairs_mut()
        .append_pair("q", &format!("{keyword} when:{lookback_days}d"))
        .append_pair("hl", "en-US")
        .append_pair("gl", "US")
        .append_pair("ceid", "US:en");
    url.to_string()
}

/// Fetch and parse one keyword's feed, dropping entries older than
/// `cutoff` when they carry a parseable timestamp. Entries without one are
/// kept.
pub async fn fetch_keyword(
    transport: &dyn FeedTransport,
    keyword: &str,
    lookback_days: u32,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Article>, FetchError> {
    let url = feed_url(keyword, lookback_days);
    debug!(keyword, url = %url, "fetching feed");
    let body = transport.fetch(&url).await?;
    let articles = parse_feed(&body, keyword, cutoff)?;
    debug!(keyword, count = articles.len(), "keyword fetch finished");
    Ok(articles)
}

/// Parse a feed document into articles for `keyword`.
pub fn parse_feed(
    xml: &str,
    keyword: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Article>, FetchError> {
    let cleaned = scrub_html_entities_for_xml(xml);
    let rss: Rss = quick_xml::de::from_str(&cleaned)
        .map_err(|e| FetchError::Parse(format!("feed xml: {e}")))?;

    let mut out = Vec::with_capacity(rss.channel.items.len());
    for item in rss.channel.items {
        let published = item.pub_date.as_deref().and_then(parse_pub_date);
        if let Some(ts) = published {
            if ts < cutoff {
                continue;
            }
        }

        let title = item.title.unwrap_or_default();
        let source = extract_source(item.source.as_ref(), &title);
        out.push(Article {
            snippet: clean_snippet(item.description.as_deref().unwrap_or_default()),
            url: item.link.unwrap_or_default(),
            published,
            source,
            keyword: keyword.to_string(),
            original_feed_url: None,
            title,
        });
    }
    Ok(out)
}

fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc2822(raw) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(raw, error = %e, "unparseable pubDate, keeping entry undated");
            None
        }
    }
}

/// The feed carries the publisher in a `<source>` element; failing that,
/// Google appends it to the title after the last " - ".
fn extract_source(source: Option<&Source>, title: &str) -> String {
    if let Some(name) = source.and_then(|s| s.name.as_deref()) {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Some((_, tail)) = title.rsplit_once(" - ") {
        let tail = tail.trim();
        if !tail.is_empty() {
            return tail.to_string();
        }
    }
    "Unknown".to_string()
}

/// Snippets arrive as escaped HTML; decode entities, strip tags, collapse
/// whitespace.
fn clean_snippet(raw: &str) -> String {
    let decoded = html_escape::decode_html_entities(raw).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(&decoded, " ");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re_ws.replace_all(stripped.trim(), " ").into_owned()
}

/// HTML-only entities are invalid XML; neutralize the common ones before
/// handing the document to the parser.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

/// Production transport: plain HTTP GET with a fixed user-agent and
/// timeout.
pub struct HttpFeedTransport {
    client: reqwest::Client,
}

impl HttpFeedTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFeedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FeedTransport for HttpFeedTransport {
    async fn fetch(&self, feed_url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(feed_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>"rezoning" - Google News</title>
    <item>
      <title>Council approves rezoning - City Paper</title>
      <link>https://news.google.com/rss/articles/abc?oc=5</link>
      <pubDate>Tue, 04 Aug 2026 12:00:00 GMT</pubDate>
      <description>&lt;a href="x"&gt;Council approves&amp;nbsp;rezoning&lt;/a&gt;</description>
      <source url="https://citypaper.example">City Paper</source>
    </item>
    <item>
      <title>Old story - Gazette</title>
      <link>https://news.google.com/rss/articles/old?oc=5</link>
      <pubDate>Sat, 01 Aug 2026 12:00:00 GMT</pubDate>
      <description>stale</description>
    </item>
    <item>
      <title>Undated story</title>
      <link>https://news.google.com/rss/articles/nodate?oc=5</link>
      <description>no timestamp</description>
    </item>
  </channel>
</rss>
"#;

    fn cutoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 0, 0, 0).unwrap()
    }

    #[test]
    fn parses_entries_and_applies_lookback_cutoff() {
        let articles = parse_feed(FEED, "rezoning", cutoff()).unwrap();
        // The dated-but-old entry is dropped; the undated one is kept.
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].source, "City Paper");
        assert_eq!(articles[0].keyword, "rezoning");
        assert!(articles[0].published.is_some());
        assert!(articles[1].published.is_none());
    }

    #[test]
    fn snippet_is_decoded_and_tag_free() {
        let articles = parse_feed(FEED, "rezoning", cutoff()).unwrap();
        assert_eq!(articles[0].snippet, "Council approves rezoning");
    }

    #[test]
    fn source_falls_back_to_title_suffix() {
        assert_eq!(extract_source(None, "Big vote - Gazette"), "Gazette");
        assert_eq!(extract_source(None, "No separator"), "Unknown");
    }

    #[test]
    fn feed_url_embeds_keyword_and_window() {
        let url = feed_url("city council", 2);
        assert!(url.starts_with("https://news.google.com/rss/search?"));
        assert!(url.contains("city+council+when%3A2d"));
    }

    #[test]
    fn malformed_xml_is_a_parse_error() {
        let err = parse_feed("<not-a-feed>", "k", cutoff()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(!err.is_transient());
    }
}
