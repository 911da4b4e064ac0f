//! Telegram Bot API delivery over plain HTTP, no SDK.

use std::path::Path;
use std::time::Duration;

use tracing::info;

use super::RunStats;
use crate::analyze::AnalyzedResult;
use crate::retry::RetryPolicy;

const ENV_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
const ENV_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
const SUMMARY_LIMIT: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("telegram transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("telegram api error: HTTP {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("report file error: {0}")]
    Io(#[from] std::io::Error),
}

impl NotifyError {
    fn is_transient(&self) -> bool {
        matches!(self, NotifyError::Transport(_))
    }
}

pub struct TelegramNotifier {
    base_url: String,
    chat_id: String,
    subject_name: String,
    subject_emoji: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: String, subject_name: String, subject_emoji: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("https://api.telegram.org/bot{token}"),
            chat_id,
            subject_name,
            subject_emoji,
            client,
            retry: RetryPolicy::new(2, Duration::from_secs(3), 2.0),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`; `None` (with
    /// an error log) when either is missing.
    pub fn from_env(subject_name: &str, subject_emoji: &str) -> Option<Self> {
        let token = std::env::var(ENV_TOKEN).ok()?;
        let chat_id = std::env::var(ENV_CHAT_ID).ok()?;
        Some(Self::new(
            &token,
            chat_id,
            subject_name.to_string(),
            subject_emoji.to_string(),
        ))
    }

    fn header(&self, date: &str) -> String {
        if self.subject_emoji.is_empty() {
            format!("{} \u{2014} {date}", self.subject_name)
        } else {
            format!("{} {} \u{2014} {date}", self.subject_emoji, self.subject_name)
        }
    }

    /// Formatted summary with per-article score indicators, capped at the
    /// top results.
    pub async fn send_summary(
        &self,
        kept: &[&AnalyzedResult],
        stats: &RunStats,
    ) -> Result<(), NotifyError> {
        let mut lines = vec![
            self.header(&stats.date),
            String::new(),
            format!("Scanned: {} articles", stats.total_scanned),
            format!(
                "Opportunities: {} ({} high priority)",
                stats.kept_count, stats.high_priority_count
            ),
            format!("Killed: {}", stats.killed_count),
            String::new(),
        ];

        for article in kept.iter().take(SUMMARY_LIMIT) {
            let emoji = if article.score >= 8 {
                "\u{1F534}"
            } else {
                "\u{1F7E1}"
            };
            let location = match (article.city.is_empty(), article.state.is_empty()) {
                (false, false) => format!("{}, {}", article.city, article.state),
                (false, true) => article.city.clone(),
                (true, false) => article.state.clone(),
                (true, true) => String::new(),
            };
            let headline: String = article.headline.chars().take(80).collect();
            lines.push(format!("{emoji} {}/10 \u{2014} {location}", article.score));
            lines.push(headline);
            lines.push(article.classification.clone());
            lines.push(format!("\u{2192} {}", article.stage));
            lines.push(String::new());
        }

        lines.push("---".to_string());
        lines.push("Full report attached \u{2193}".to_string());

        self.send_message(&lines.join("\n")).await
    }

    pub async fn send_no_results(&self, stats: &RunStats) -> Result<(), NotifyError> {
        let text = format!(
            "{}\n\nScanned: {} articles\nNo opportunities found today.\n\nAll {} articles were filtered out.",
            self.header(&stats.date),
            stats.total_scanned,
            stats.killed_count,
        );
        self.send_message(&text).await
    }

    /// Attach the HTML report as a document.
    pub async fn send_report(&self, report_path: &Path) -> Result<(), NotifyError> {
        let file_name = report_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "report.html".to_string());
        let bytes = std::fs::read(report_path)?;
        let url = format!("{}/sendDocument", self.base_url);
        let caption = format!("Daily {} Report", self.subject_name);

        self.retry
            .run("telegram sendDocument", NotifyError::is_transient, || {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str("text/html")
                    .expect("static mime type");
                let form = reqwest::multipart::Form::new()
                    .text("chat_id", self.chat_id.clone())
                    .text("caption", caption.clone())
                    .part("document", part);
                let url = url.clone();
                async move {
                    let resp = self.client.post(&url).multipart(form).send().await?;
                    Self::check(resp).await
                }
            })
            .await?;

        info!(report = %report_path.display(), "report sent to telegram");
        Ok(())
    }

    pub async fn send_test(&self) -> Result<(), NotifyError> {
        let text = format!(
            "{}\n\nTelegram delivery is working correctly.",
            self.header("Test message")
        );
        self.send_message(&text).await
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/sendMessage", self.base_url);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });
        self.retry
            .run("telegram sendMessage", NotifyError::is_transient, || {
                let url = url.clone();
                let payload = payload.clone();
                async move {
                    let resp = self.client.post(&url).json(&payload).send().await?;
                    Self::check(resp).await
                }
            })
            .await
    }

    async fn check(resp: reqwest::Response) -> Result<(), NotifyError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = resp.text().await.unwrap_or_default();
        let detail = detail.chars().take(200).collect::<String>();
        Err(NotifyError::Api {
            status: status.as_u16(),
            detail,
        })
    }
}
