// src/analyze/mod.rs
//! Batch orchestration: split articles into fixed-size batches, drive the
//! synchronous or asynchronous submission protocol, normalize every reply,
//! and account token usage.
//!
//! Both protocols degrade per batch: a batch that cannot be classified or
//! parsed lands in the failure sink and the run continues. The one fault
//! that crosses this boundary is the asynchronous job outliving its wait
//! budget.

pub mod client;
pub mod failures;
pub mod parse;
pub mod validate;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ingest::types::Article;
use crate::retry::RetryPolicy;

pub use client::{
    BatchOutcome, BatchRequest, Classifier, ClassifyError, MessageRequest, MessageResponse,
    TokenUsage,
};
pub use validate::{AnalyzedResult, FieldDefaults};

pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_MAX_TOKENS: u32 = 16_384;

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub model: String,
    pub max_tokens: u32,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub max_poll_wait: Option<Duration>,
    /// Failure sink directory, already namespaced by subject.
    pub failure_dir: PathBuf,
}

impl AnalyzeOptions {
    pub fn new(model: impl Into<String>, failure_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::classify(),
            poll_interval: Duration::from_secs(10),
            max_poll_wait: Some(Duration::from_secs(3600)),
            failure_dir: failure_dir.into(),
        }
    }
}

/// Build the user message for one batch: a compact JSON article array plus
/// the one-decision-per-item instruction.
fn build_user_message(articles: &[Article]) -> String {
    let payload: Vec<_> = articles
        .iter()
        .map(|a| {
            json!({
                "title": a.title,
                "snippet": a.snippet,
                "url": a.url,
                "published": a.published.map(|d| d.to_rfc3339()).unwrap_or_default(),
                "source": a.source,
            })
        })
        .collect();
    format!(
        "Analyze the following {count} articles. Return a JSON array with EXACTLY \
         {count} objects — one KEEP or KILL decision per article. Do not skip any.\n\n\
         ```json\n{body}\n```",
        count = payload.len(),
        body = serde_json::Value::Array(payload),
    )
}

fn message_request(opts: &AnalyzeOptions, system_prompt: &str, batch: &[Article]) -> MessageRequest {
    MessageRequest {
        model: opts.model.clone(),
        max_tokens: opts.max_tokens,
        system: system_prompt.to_string(),
        user: build_user_message(batch),
    }
}

/// Parse and validate one reply; an unparseable reply sends the batch to
/// the failure sink and contributes nothing.
fn normalize_reply(
    text: &str,
    batch: &[Article],
    defaults: &FieldDefaults,
    opts: &AnalyzeOptions,
) -> Vec<AnalyzedResult> {
    match parse::parse_response(text) {
        Some(candidates) => validate::validate_results(candidates, defaults),
        None => {
            error!("could not parse classification response");
            debug!(preview = %text.chars().take(500).collect::<String>(), "raw response");
            sink_batch(opts, batch);
            Vec::new()
        }
    }
}

fn sink_batch(opts: &AnalyzeOptions, batch: &[Article]) {
    if let Err(e) = failures::save_failed_batch(&opts.failure_dir, batch) {
        error!(error = %e, "failed to persist batch to failure sink");
    }
}

/// Synchronous mode: one blocking classification call per batch, retried
/// on transient failures; a batch that exhausts its retries is persisted
/// and skipped.
pub async fn analyze_articles(
    classifier: &dyn Classifier,
    system_prompt: &str,
    articles: &[Article],
    defaults: &FieldDefaults,
    opts: &AnalyzeOptions,
) -> (Vec<AnalyzedResult>, TokenUsage) {
    let mut results = Vec::new();
    let mut total = TokenUsage::default();

    if articles.is_empty() {
        info!("no articles to analyze");
        return (results, total);
    }

    let batches: Vec<&[Article]> = articles.chunks(opts.batch_size.max(1)).collect();
    info!(
        articles = articles.len(),
        batches = batches.len(),
        model = %opts.model,
        "analyzing articles"
    );

    for (idx, batch) in batches.iter().enumerate() {
        let request = message_request(opts, system_prompt, batch);
        let reply = opts
            .retry
            .run("classification call", ClassifyError::is_transient, || {
                classifier.create_message(&request)
            })
            .await;

        match reply {
            Ok(response) => {
                if response.truncated() {
                    warn!(
                        batch = idx,
                        max_tokens = opts.max_tokens,
                        "response truncated at the output-token ceiling"
                    );
                }
                total.accumulate(&response.usage);
                info!(
                    batch = idx,
                    input = response.usage.input_tokens,
                    output = response.usage.output_tokens,
                    cache_create = response.usage.cache_creation_input_tokens,
                    cache_read = response.usage.cache_read_input_tokens,
                    "batch usage"
                );
                results.extend(normalize_reply(&response.text, batch, defaults, opts));
            }
            Err(e) => {
                error!(batch = idx, error = %e, "batch analysis failed after retries");
                sink_batch(opts, batch);
            }
        }
    }

    log_total_usage(&total);
    (results, total)
}

/// Asynchronous mode: every batch becomes one named request in a single
/// job, polled until `ended`. Result order follows ascending batch index,
/// not arrival order. The only error surfaced to the caller is a job that
/// cannot be brought to an observed end (wait budget exceeded, or the
/// poll/fetch itself failing for good).
pub async fn analyze_articles_batched(
    classifier: &dyn Classifier,
    system_prompt: &str,
    articles: &[Article],
    defaults: &FieldDefaults,
    opts: &AnalyzeOptions,
) -> Result<(Vec<AnalyzedResult>, TokenUsage), ClassifyError> {
    let mut total = TokenUsage::default();
    if articles.is_empty() {
        info!("no articles to analyze");
        return Ok((Vec::new(), total));
    }

    let batches: Vec<&[Article]> = articles.chunks(opts.batch_size.max(1)).collect();
    let requests: Vec<BatchRequest> = batches
        .iter()
        .enumerate()
        .map(|(idx, batch)| BatchRequest {
            custom_id: format!("batch-{idx}"),
            body: message_request(opts, system_prompt, batch),
        })
        .collect();

    info!(requests = requests.len(), "submitting batch job");
    let submitted = opts
        .retry
        .run("batch submit", ClassifyError::is_transient, || {
            classifier.submit_batch(&requests)
        })
        .await;
    let job_id = match submitted {
        Ok(id) => id,
        Err(e) => {
            // Degrade like a sync batch failure: persist everything and
            // let the run continue empty-handed.
            error!(error = %e, "batch submission failed after retries");
            for batch in &batches {
                sink_batch(opts, batch);
            }
            return Ok((Vec::new(), total));
        }
    };

    info!(job_id = %job_id, "batch job created, polling until it ends");
    let started = Instant::now();
    loop {
        let status = opts
            .retry
            .run("batch status poll", ClassifyError::is_transient, || {
                classifier.batch_status(&job_id)
            })
            .await?;
        info!(
            job_id = %job_id,
            status = %status.processing_status,
            succeeded = status.request_counts.succeeded,
            errored = status.request_counts.errored,
            expired = status.request_counts.expired,
            canceled = status.request_counts.canceled,
            "batch job status"
        );
        if status.ended() {
            break;
        }
        if let Some(max_wait) = opts.max_poll_wait {
            if started.elapsed() + opts.poll_interval > max_wait {
                return Err(ClassifyError::PollTimeout {
                    job_id,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
        }
        tokio::time::sleep(opts.poll_interval).await;
    }

    let entries = opts
        .retry
        .run("batch results fetch", ClassifyError::is_transient, || {
            classifier.batch_results(&job_id)
        })
        .await?;

    // Arrival order is not guaranteed; key by batch index and reassemble
    // ascending.
    let mut by_index: BTreeMap<usize, Vec<AnalyzedResult>> = BTreeMap::new();
    for entry in entries {
        let Some(idx) = entry
            .custom_id
            .strip_prefix("batch-")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|idx| *idx < batches.len())
        else {
            warn!(custom_id = %entry.custom_id, "unrecognized custom id in results");
            continue;
        };
        match entry.outcome {
            BatchOutcome::Succeeded(message) => {
                total.accumulate(&message.usage);
                if message.truncated() {
                    warn!(custom_id = %entry.custom_id, "batch request truncated");
                }
                by_index.insert(idx, normalize_reply(&message.text, batches[idx], defaults, opts));
            }
            other => {
                error!(
                    custom_id = %entry.custom_id,
                    outcome = other.label(),
                    "batch request failed"
                );
                sink_batch(opts, batches[idx]);
            }
        }
    }

    let mut results = Vec::new();
    for (_, mut chunk) in by_index {
        results.append(&mut chunk);
    }

    log_total_usage(&total);
    Ok((results, total))
}

fn log_total_usage(total: &TokenUsage) {
    info!(
        input = total.input_tokens,
        output = total.output_tokens,
        cache_create = total.cache_creation_input_tokens,
        cache_read = total.cache_read_input_tokens,
        "total token usage"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_embeds_count_and_compact_payload() {
        let articles = vec![Article {
            title: "T".into(),
            snippet: "S".into(),
            url: "https://a.example/1".into(),
            published: None,
            source: "Src".into(),
            keyword: "k".into(),
            original_feed_url: None,
        }];
        let msg = build_user_message(&articles);
        assert!(msg.starts_with("Analyze the following 1 articles."));
        assert!(msg.contains(r#""title":"T""#));
        assert!(msg.contains(r#""published":"""#));
    }
}
