// tests/analyze_sync.rs
// Synchronous batch orchestration against a scripted classifier: result
// normalization, usage accumulation, failure-sink fallback.

use std::sync::Mutex;

use async_trait::async_trait;

use gnews_triage::analyze::client::{
    BatchRequest, BatchResultEntry, BatchStatus, Classifier, ClassifyError, MessageRequest,
    MessageResponse,
};
use gnews_triage::analyze::{analyze_articles, AnalyzeOptions, FieldDefaults, TokenUsage};
use gnews_triage::{Article, RetryPolicy};

enum Script {
    Reply(&'static str, TokenUsage),
    Reject,
}

/// Pops one scripted step per classification call.
struct ScriptedClassifier {
    steps: Mutex<Vec<Script>>,
}

impl ScriptedClassifier {
    fn new(mut steps: Vec<Script>) -> Self {
        steps.reverse();
        Self {
            steps: Mutex::new(steps),
        }
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn create_message(&self, _req: &MessageRequest) -> Result<MessageResponse, ClassifyError> {
        match self.steps.lock().unwrap().pop() {
            Some(Script::Reply(text, usage)) => Ok(MessageResponse {
                text: text.to_string(),
                usage,
                stop_reason: Some("end_turn".to_string()),
            }),
            Some(Script::Reject) => Err(ClassifyError::Rejected {
                status: 400,
                detail: "scripted rejection".to_string(),
            }),
            None => panic!("classifier called more often than scripted"),
        }
    }

    async fn submit_batch(&self, _requests: &[BatchRequest]) -> Result<String, ClassifyError> {
        unimplemented!("not used in sync tests")
    }

    async fn batch_status(&self, _job_id: &str) -> Result<BatchStatus, ClassifyError> {
        unimplemented!("not used in sync tests")
    }

    async fn batch_results(&self, _job_id: &str) -> Result<Vec<BatchResultEntry>, ClassifyError> {
        unimplemented!("not used in sync tests")
    }
}

fn article(n: usize) -> Article {
    Article {
        title: format!("article {n}"),
        snippet: "s".to_string(),
        url: format!("https://paper.example/{n}"),
        published: None,
        source: "Paper".to_string(),
        keyword: "k".to_string(),
        original_feed_url: None,
    }
}

fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        cache_creation_input_tokens: 0,
        cache_read_input_tokens: input / 2,
    }
}

fn options(failure_dir: &std::path::Path, batch_size: usize) -> AnalyzeOptions {
    let mut opts = AnalyzeOptions::new("test-model", failure_dir);
    opts.batch_size = batch_size;
    opts.retry = RetryPolicy::new(2, std::time::Duration::from_millis(1), 2.0);
    opts
}

#[tokio::test]
async fn reply_is_parsed_validated_and_clamped() {
    let tmp = tempfile::tempdir().unwrap();
    let classifier = ScriptedClassifier::new(vec![Script::Reply(
        r#"[{"decision":"keep","headline":"X","score":15}]"#,
        usage(10, 5),
    )]);

    let (results, total) = analyze_articles(
        &classifier,
        "prompt",
        &[article(0)],
        &FieldDefaults::base(),
        &options(tmp.path(), 25),
    )
    .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].decision, "KEEP");
    assert_eq!(results[0].headline, "X");
    assert_eq!(results[0].score, 10);
    assert_eq!(total, usage(10, 5));
}

#[tokio::test]
async fn usage_is_the_field_wise_sum_across_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let classifier = ScriptedClassifier::new(vec![
        Script::Reply(r#"[{"decision":"KEEP","headline":"a"}]"#, usage(10, 4)),
        Script::Reply(r#"[{"decision":"KILL","headline":"b"}]"#, usage(6, 2)),
    ]);

    // batch_size 1 forces two calls for two articles.
    let (results, total) = analyze_articles(
        &classifier,
        "prompt",
        &[article(0), article(1)],
        &FieldDefaults::base(),
        &options(tmp.path(), 1),
    )
    .await;

    assert_eq!(results.len(), 2);
    assert_eq!(total.input_tokens, 16);
    assert_eq!(total.output_tokens, 6);
    assert_eq!(total.cache_read_input_tokens, 8);
}

#[tokio::test]
async fn zero_batches_yield_an_all_zero_usage_record() {
    let tmp = tempfile::tempdir().unwrap();
    let classifier = ScriptedClassifier::new(vec![]);
    let (results, total) = analyze_articles(
        &classifier,
        "prompt",
        &[],
        &FieldDefaults::base(),
        &options(tmp.path(), 25),
    )
    .await;
    assert!(results.is_empty());
    assert_eq!(total, TokenUsage::default());
}

#[tokio::test]
async fn rejected_batch_is_persisted_and_the_run_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let classifier = ScriptedClassifier::new(vec![
        Script::Reject,
        Script::Reply(r#"[{"decision":"KEEP","headline":"survivor"}]"#, usage(5, 2)),
    ]);

    let (results, total) = analyze_articles(
        &classifier,
        "prompt",
        &[article(0), article(1)],
        &FieldDefaults::base(),
        &options(tmp.path(), 1),
    )
    .await;

    // Second batch survived the first one's failure.
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].headline, "survivor");
    assert_eq!(total.input_tokens, 5);

    // The failed batch's payload landed in the sink, verbatim.
    let sunk: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
    assert_eq!(sunk.len(), 1);
    let restored: Vec<Article> = serde_json::from_str(
        &std::fs::read_to_string(sunk[0].as_ref().unwrap().path()).unwrap(),
    )
    .unwrap();
    assert_eq!(restored, vec![article(0)]);
}

#[tokio::test]
async fn unparseable_reply_sinks_the_batch_but_keeps_its_usage() {
    let tmp = tempfile::tempdir().unwrap();
    let classifier = ScriptedClassifier::new(vec![Script::Reply(
        "I cannot help with that.",
        usage(9, 3),
    )]);

    let (results, total) = analyze_articles(
        &classifier,
        "prompt",
        &[article(0)],
        &FieldDefaults::base(),
        &options(tmp.path(), 25),
    )
    .await;

    assert!(results.is_empty());
    // The call was made and paid for even though nothing parsed.
    assert_eq!(total.input_tokens, 9);
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
}
