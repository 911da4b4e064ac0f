//! Binary entrypoint: CLI parsing, logging setup, process lifecycle.
//!
//! Everything domain-shaped lives in the library; this file only wires
//! the real collaborators together and owns exit codes.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gnews_triage::analyze::client::ApiClient;
use gnews_triage::ingest::gnews::HttpFeedTransport;
use gnews_triage::ingest::resolve::{NoopDecoder, RedirectDecoder, UnshortenClient};
use gnews_triage::notify::telegram::TelegramNotifier;
use gnews_triage::{list_subjects, load_subject, run_pipeline, RunContext, RunOptions};

const ENV_DECODER_URL: &str = "GNEWS_DECODER_URL";

#[derive(Parser, Debug)]
#[command(
    name = "gnews-triage",
    version,
    about = "Keyword news monitoring pipeline"
)]
struct Cli {
    /// Subject slug to run (e.g. rezoning, infrastructure)
    #[arg(long)]
    subject: Option<String>,

    /// Run all available subjects sequentially
    #[arg(long)]
    all_subjects: bool,

    /// List all available subjects and exit
    #[arg(long)]
    list_subjects: bool,

    /// Fetch articles and print them, skipping classification and delivery
    #[arg(long)]
    dry_run: bool,

    /// Override days_lookback from config
    #[arg(long)]
    days: Option<u32>,

    /// Submit through the asynchronous batch API (cheaper, results take minutes)
    #[arg(long)]
    batch_api: bool,

    /// Send a test message to Telegram and exit
    #[arg(long)]
    test_telegram: bool,

    /// Enable DEBUG logging
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let _ = dotenvy::dotenv();

    let root = PathBuf::from(".");

    if cli.list_subjects {
        return match list_subjects(&root) {
            Ok(subjects) if subjects.is_empty() => {
                println!("No subjects found in subjects/ directory.");
                ExitCode::FAILURE
            }
            Ok(subjects) => {
                println!("Available subjects:");
                for s in subjects {
                    println!("  {:20} {} - {}", s.slug, s.name, s.description);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to list subjects");
                ExitCode::FAILURE
            }
        };
    }

    if cli.test_telegram {
        let Some(notifier) = TelegramNotifier::from_env("Monitor", "") else {
            error!("TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID not set");
            return ExitCode::FAILURE;
        };
        return match notifier.send_test().await {
            Ok(()) => {
                info!("test message sent successfully");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "test message failed");
                ExitCode::FAILURE
            }
        };
    }

    if cli.subject.is_none() && !cli.all_subjects {
        eprintln!("error: --subject <name> or --all-subjects is required");
        return ExitCode::from(2);
    }

    // Real collaborators. The classifier key is only required when the
    // run will actually classify.
    let transport = HttpFeedTransport::new();
    let decoder: Box<dyn RedirectDecoder> = match std::env::var(ENV_DECODER_URL) {
        Ok(endpoint) => Box::new(UnshortenClient::new(endpoint)),
        Err(_) => Box::new(NoopDecoder),
    };
    let classifier = match ApiClient::from_env() {
        Ok(client) => client,
        Err(e) if cli.dry_run => {
            warn!(error = %e, "classifier not configured; fine for a dry run");
            ApiClient::new(String::new(), String::new())
        }
        Err(e) => {
            error!(error = %e, "classifier not configured");
            return ExitCode::FAILURE;
        }
    };

    let opts = RunOptions {
        days_override: cli.days,
        dry_run: cli.dry_run,
        use_batch_api: cli.batch_api,
    };

    let slugs: Vec<String> = if cli.all_subjects {
        match list_subjects(&root) {
            Ok(subjects) if !subjects.is_empty() => {
                subjects.into_iter().map(|s| s.slug).collect()
            }
            Ok(_) => {
                error!("no subjects found in subjects/ directory");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!(error = %e, "failed to list subjects");
                return ExitCode::FAILURE;
            }
        }
    } else {
        vec![cli.subject.clone().expect("checked above")]
    };

    let mut any_failed = false;
    for slug in &slugs {
        info!(subject = %slug, "running subject");
        if !run_subject(&root, slug, opts, &transport, decoder.as_ref(), &classifier).await {
            any_failed = true;
        }
    }

    if any_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Run one subject end to end. Returns false when the run reported errors;
/// a failing subject never stops the remaining ones.
async fn run_subject(
    root: &Path,
    slug: &str,
    opts: RunOptions,
    transport: &HttpFeedTransport,
    decoder: &dyn RedirectDecoder,
    classifier: &ApiClient,
) -> bool {
    let subject = match load_subject(root, slug) {
        Ok(subject) => subject,
        Err(e) => {
            error!(subject = %slug, error = %e, "failed to load subject");
            return false;
        }
    };

    let notifier = if subject.config.telegram_enabled {
        TelegramNotifier::from_env(&subject.name, &subject.emoji)
    } else {
        None
    };

    let ctx = RunContext {
        root,
        transport,
        decoder,
        classifier,
        notifier: notifier.as_ref(),
    };

    let summary = run_pipeline(&subject, opts, &ctx).await;

    match gnews_triage::runner::save_run_log(root, &summary) {
        Ok(path) => info!(subject = %slug, path = %path.display(), "run log saved"),
        Err(e) => error!(subject = %slug, error = %e, "failed to save run log"),
    }

    println!(
        "\n[{}] Pipeline complete: {} fetched, {} kept, {} killed",
        slug, summary.articles_fetched, summary.articles_kept, summary.articles_killed
    );
    if let Some(report) = &summary.report_path {
        println!("[{slug}] Report: {report}");
    }

    if summary.errors.is_empty() {
        true
    } else {
        warn!(subject = %slug, errors = summary.errors.len(), "run completed with errors");
        false
    }
}
