//! Classification service client: provider trait + reqwest implementation.
//!
//! Two submission protocols share one seam. The synchronous path is one
//! messages call per batch; the asynchronous path submits every batch as a
//! named request in a single job, then polls it. Tests implement
//! [`Classifier`] directly; nothing below the trait touches the network in
//! the test suite.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Token-consumption counters returned by the service per request.
/// Accumulated additively across batches; `Default` is all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct MessageResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
}

impl MessageResponse {
    pub fn truncated(&self) -> bool {
        self.stop_reason.as_deref() == Some("max_tokens")
    }
}

/// One named request inside an asynchronous job.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub custom_id: String,
    pub body: MessageRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub processing: u64,
    #[serde(default)]
    pub succeeded: u64,
    #[serde(default)]
    pub errored: u64,
    #[serde(default)]
    pub expired: u64,
    #[serde(default)]
    pub canceled: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchStatus {
    pub processing_status: String,
    #[serde(default)]
    pub request_counts: RequestCounts,
}

impl BatchStatus {
    pub fn ended(&self) -> bool {
        self.processing_status == "ended"
    }
}

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Succeeded(MessageResponse),
    Errored(String),
    Expired,
    Canceled,
}

impl BatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BatchOutcome::Succeeded(_) => "succeeded",
            BatchOutcome::Errored(_) => "errored",
            BatchOutcome::Expired => "expired",
            BatchOutcome::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchResultEntry {
    pub custom_id: String,
    pub outcome: BatchOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rate limited: HTTP 429")]
    RateLimited,

    #[error("service error: HTTP {0}")]
    Server(u16),

    #[error("request rejected: HTTP {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("malformed service response: {0}")]
    Decode(String),

    #[error("batch job {job_id} not finished after {waited_secs}s")]
    PollTimeout { job_id: String, waited_secs: u64 },
}

impl ClassifyError {
    /// Connection errors, rate limits and 5xx are retryable; rejected
    /// requests and undecodable bodies are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClassifyError::Transport(_) | ClassifyError::RateLimited | ClassifyError::Server(_)
        )
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn create_message(&self, req: &MessageRequest) -> Result<MessageResponse, ClassifyError>;
    async fn submit_batch(&self, requests: &[BatchRequest]) -> Result<String, ClassifyError>;
    async fn batch_status(&self, job_id: &str) -> Result<BatchStatus, ClassifyError>;
    async fn batch_results(&self, job_id: &str) -> Result<Vec<BatchResultEntry>, ClassifyError>;
}

// ---- wire types ----

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(default)]
    usage: TokenUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

impl WireMessage {
    fn into_response(self) -> MessageResponse {
        let text = self
            .content
            .into_iter()
            .find(|c| c.kind == "text")
            .map(|c| c.text)
            .unwrap_or_default();
        MessageResponse {
            text,
            usage: self.usage,
            stop_reason: self.stop_reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireBatchCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireBatchResult {
    Succeeded {
        message: WireMessage,
    },
    Errored {
        #[serde(default)]
        error: serde_json::Value,
    },
    Expired,
    Canceled,
}

#[derive(Debug, Deserialize)]
struct WireBatchEntry {
    custom_id: String,
    result: WireBatchResult,
}

// ---- reqwest-backed implementation ----

pub struct ApiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Build a client from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var(ENV_API_KEY)
            .map_err(|_| anyhow::anyhow!("{ENV_API_KEY} is not set"))?;
        Ok(Self::new(DEFAULT_BASE_URL.to_string(), api_key))
    }

    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            api_key,
            client,
        }
    }

    fn message_params(req: &MessageRequest) -> serde_json::Value {
        json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "system": [{
                "type": "text",
                "text": req.system,
                "cache_control": {"type": "ephemeral"},
            }],
            "messages": [{"role": "user", "content": req.user}],
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    /// Map a non-success status onto the error taxonomy the retry
    /// predicate understands.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClassifyError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status.as_u16() == 429 {
            return Err(ClassifyError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ClassifyError::Server(status.as_u16()));
        }
        let detail = resp.text().await.unwrap_or_default();
        let detail = detail.chars().take(300).collect::<String>();
        Err(ClassifyError::Rejected {
            status: status.as_u16(),
            detail,
        })
    }
}

#[async_trait]
impl Classifier for ApiClient {
    async fn create_message(&self, req: &MessageRequest) -> Result<MessageResponse, ClassifyError> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/messages")
            .json(&Self::message_params(req))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let message: WireMessage = resp
            .json()
            .await
            .map_err(|e| ClassifyError::Decode(e.to_string()))?;
        Ok(message.into_response())
    }

    async fn submit_batch(&self, requests: &[BatchRequest]) -> Result<String, ClassifyError> {
        let body = json!({
            "requests": requests
                .iter()
                .map(|r| json!({
                    "custom_id": r.custom_id,
                    "params": Self::message_params(&r.body),
                }))
                .collect::<Vec<_>>(),
        });
        let resp = self
            .request(reqwest::Method::POST, "/v1/messages/batches")
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let created: WireBatchCreated = resp
            .json()
            .await
            .map_err(|e| ClassifyError::Decode(e.to_string()))?;
        Ok(created.id)
    }

    async fn batch_status(&self, job_id: &str) -> Result<BatchStatus, ClassifyError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/v1/messages/batches/{job_id}"))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        resp.json()
            .await
            .map_err(|e| ClassifyError::Decode(e.to_string()))
    }

    async fn batch_results(&self, job_id: &str) -> Result<Vec<BatchResultEntry>, ClassifyError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/messages/batches/{job_id}/results"),
            )
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body = resp.text().await?;

        // Results arrive as one JSON object per line.
        let mut entries = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let wire: WireBatchEntry = serde_json::from_str(line)
                .map_err(|e| ClassifyError::Decode(format!("results line: {e}")))?;
            let outcome = match wire.result {
                WireBatchResult::Succeeded { message } => {
                    BatchOutcome::Succeeded(message.into_response())
                }
                WireBatchResult::Errored { error } => BatchOutcome::Errored(error.to_string()),
                WireBatchResult::Expired => BatchOutcome::Expired,
                WireBatchResult::Canceled => BatchOutcome::Canceled,
            };
            entries.push(BatchResultEntry {
                custom_id: wire.custom_id,
                outcome,
            });
        }
        Ok(entries)
    }
}
