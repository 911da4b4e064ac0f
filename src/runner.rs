//! Pipeline driver: fetch, analyze, report, deliver, one subject per run.
//!
//! Every stage failure is isolated at its own boundary: a dead keyword, a
//! failed batch, or a refused Telegram send degrades the run summary, it
//! never aborts the stages around it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::analyze::client::Classifier;
use crate::analyze::{self, AnalyzeOptions, TokenUsage};
use crate::ingest::resolve::RedirectDecoder;
use crate::ingest::types::FeedTransport;
use crate::ingest::{self, IngestConfig};
use crate::notify::telegram::TelegramNotifier;
use crate::notify::RunStats;
use crate::report;
use crate::retry::RetryPolicy;
use crate::subject::Subject;

/// External collaborators for one run, behind their seams so tests can
/// swap all of them.
pub struct RunContext<'a> {
    pub root: &'a Path,
    pub transport: &'a dyn FeedTransport,
    pub decoder: &'a dyn RedirectDecoder,
    pub classifier: &'a dyn Classifier,
    pub notifier: Option<&'a TelegramNotifier>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub days_override: Option<u32>,
    pub dry_run: bool,
    pub use_batch_api: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub start_time: String,
    pub end_time: String,
    pub date: String,
    pub subject: String,
    pub dry_run: bool,
    pub articles_fetched: usize,
    pub articles_analyzed: usize,
    pub articles_kept: usize,
    pub articles_killed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opportunities_path: Option<String>,
    pub errors: Vec<String>,
}

/// Execute the full pipeline for one subject.
pub async fn run_pipeline(
    subject: &Subject,
    opts: RunOptions,
    ctx: &RunContext<'_>,
) -> RunSummary {
    let now = chrono::Local::now();
    let date = now.format("%Y-%m-%d").to_string();

    let mut summary = RunSummary {
        start_time: now.to_rfc3339(),
        date: date.clone(),
        subject: subject.slug.clone(),
        dry_run: opts.dry_run,
        ..Default::default()
    };

    let config = &subject.config;
    if subject.keywords.is_empty() {
        warn!(subject = %subject.slug, "no keywords configured");
        return finish(summary);
    }

    // --- fetch ---
    let lookback_days = opts.days_override.unwrap_or(config.days_lookback);
    info!(
        subject = %subject.slug,
        keywords = subject.keywords.len(),
        lookback_days,
        max = config.max_articles_per_run,
        "fetching articles"
    );
    let articles = ingest::fetch_all_articles(
        ctx.transport,
        ctx.decoder,
        &subject.keywords,
        IngestConfig {
            lookback_days,
            max_articles: config.max_articles_per_run,
        },
        &RetryPolicy::feed(),
    )
    .await;
    summary.articles_fetched = articles.len();

    if articles.is_empty() {
        info!(subject = %subject.slug, "no articles fetched from any keyword");
        if !opts.dry_run && config.telegram_enabled {
            let stats = RunStats {
                date: date.clone(),
                ..Default::default()
            };
            deliver_no_results(ctx, &stats, &mut summary).await;
        }
        return finish(summary);
    }

    // --- dry run ---
    if opts.dry_run {
        info!(subject = %subject.slug, count = articles.len(), "dry run, printing articles");
        for (i, article) in articles.iter().enumerate() {
            println!(
                "\n[{}] {}\n    Source: {}\n    URL: {}\n    Published: {}\n    Keyword: {}",
                i + 1,
                article.title,
                article.source,
                article.url,
                article
                    .published
                    .map(|d| d.to_rfc3339())
                    .unwrap_or_default(),
                article.keyword,
            );
        }
        return finish(summary);
    }

    // --- analyze ---
    let api_mode = if opts.use_batch_api {
        "batch API"
    } else {
        "standard API"
    };
    info!(
        subject = %subject.slug,
        count = articles.len(),
        model = %config.model,
        api_mode,
        "analyzing articles"
    );

    let analyze_opts = AnalyzeOptions {
        model: config.model.clone(),
        max_tokens: config.max_tokens,
        batch_size: config.batch_size,
        retry: config.classify_retry(),
        poll_interval: std::time::Duration::from_secs(config.batch_poll_interval_seconds),
        max_poll_wait: Some(std::time::Duration::from_secs(config.batch_max_wait_seconds)),
        failure_dir: ctx.root.join("logs").join("failed").join(&subject.slug),
    };
    let defaults = subject.field_defaults();

    let (analyzed, usage) = if opts.use_batch_api {
        match analyze::analyze_articles_batched(
            ctx.classifier,
            &subject.system_prompt,
            &articles,
            &defaults,
            &analyze_opts,
        )
        .await
        {
            Ok(out) => out,
            Err(e) => {
                error!(subject = %subject.slug, error = %e, "batch job did not complete");
                summary.errors.push(format!("batch job: {e}"));
                (Vec::new(), TokenUsage::default())
            }
        }
    } else {
        analyze::analyze_articles(
            ctx.classifier,
            &subject.system_prompt,
            &articles,
            &defaults,
            &analyze_opts,
        )
        .await
    };

    summary.articles_analyzed = analyzed.len();
    summary.token_usage = Some(usage);

    let (kept, killed) = report::partition_kept(&analyzed, config.min_opportunity_score);
    summary.articles_kept = kept.len();
    summary.articles_killed = killed.len();
    info!(
        subject = %subject.slug,
        kept = kept.len(),
        killed = killed.len(),
        "analysis complete"
    );

    // --- report ---
    let report_path = match report::generate_report(ctx.root, subject, &analyzed, &date) {
        Ok(path) => {
            summary.report_path = path.as_ref().map(|p| p.display().to_string());
            path
        }
        Err(e) => {
            error!(subject = %subject.slug, error = %e, "report generation failed");
            summary.errors.push(format!("report: {e}"));
            None
        }
    };

    match report::write_opportunities(ctx.root, subject, &kept, &date) {
        Ok(path) => summary.opportunities_path = path.map(|p| p.display().to_string()),
        Err(e) => {
            error!(subject = %subject.slug, error = %e, "opportunities artifact failed");
            summary.errors.push(format!("opportunities: {e}"));
        }
    }

    // --- deliver ---
    if config.telegram_enabled {
        let stats = RunStats {
            date: date.clone(),
            total_scanned: articles.len(),
            kept_count: kept.len(),
            killed_count: killed.len(),
            high_priority_count: kept.iter().filter(|r| r.score >= 8).count(),
        };
        match ctx.notifier {
            Some(notifier) if !kept.is_empty() => {
                if let Err(e) = notifier.send_summary(&kept, &stats).await {
                    error!(error = %e, "telegram delivery failed");
                    summary.errors.push(format!("telegram: {e}"));
                } else if let Some(path) = &report_path {
                    if let Err(e) = notifier.send_report(path).await {
                        error!(error = %e, "telegram report attachment failed");
                        summary.errors.push(format!("telegram: {e}"));
                    }
                }
            }
            Some(_) => deliver_no_results(ctx, &stats, &mut summary).await,
            None => error!("telegram enabled but TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set"),
        }
    } else {
        info!("telegram disabled in config");
    }

    finish(summary)
}

async fn deliver_no_results(ctx: &RunContext<'_>, stats: &RunStats, summary: &mut RunSummary) {
    if let Some(notifier) = ctx.notifier {
        if let Err(e) = notifier.send_no_results(stats).await {
            error!(error = %e, "telegram delivery failed");
            summary.errors.push(format!("telegram: {e}"));
        }
    } else {
        error!("telegram enabled but TELEGRAM_BOT_TOKEN/TELEGRAM_CHAT_ID not set");
    }
}

fn finish(mut summary: RunSummary) -> RunSummary {
    summary.end_time = chrono::Local::now().to_rfc3339();
    summary
}

/// Persist the structured run log under `logs/<subject>/`.
pub fn save_run_log(root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = root.join("logs").join(&summary.subject);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating log dir {}", dir.display()))?;
    let path = dir.join(format!(
        "{}.json",
        chrono::Local::now().format("%Y-%m-%d_%H%M%S")
    ));
    std::fs::write(&path, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("writing run log {}", path.display()))?;
    Ok(path)
}
