//! Degrading parser for the model's free-form reply.
//!
//! The service is asked for a bare JSON array but replies drift: prose
//! around the payload, markdown fences, or an array cut off mid-stream by
//! the output-token ceiling. Each tier tolerates one more degree of damage
//! than the one before it; the first tier that yields candidates wins.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

/// Extract loosely-typed candidate objects from raw response text.
/// Returns `None` when every tier fails; the orchestrator owns the
/// failure-sink fallback.
pub fn parse_response(text: &str) -> Option<Vec<Value>> {
    // Tier 1: the whole reply is JSON.
    if let Some(items) = as_result_array(text) {
        return Some(items);
    }

    // Tier 2: fenced code block, else the widest bracketed substring.
    for region in candidate_regions(text) {
        if let Some(items) = as_result_array(&region) {
            debug!("parsed response from extracted region");
            return Some(items);
        }
    }

    // Tier 3: recover complete objects from a truncated array.
    let objects = complete_objects(text);
    if !objects.is_empty() {
        warn!(
            recovered = objects.len(),
            "recovered partial objects from truncated response"
        );
        return Some(objects);
    }

    None
}

/// Accept a JSON array, or an object wrapping one under `articles`.
fn as_result_array(text: &str) -> Option<Vec<Value>> {
    let parsed: Value = serde_json::from_str(text.trim()).ok()?;
    match parsed {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("articles") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Candidate substrings for tier 2, in priority order: a `json`-tagged
/// fence, any fence, then the first-`[`-to-last-`]` slice.
fn candidate_regions(text: &str) -> Vec<String> {
    static RE_JSON_FENCE: OnceCell<Regex> = OnceCell::new();
    static RE_ANY_FENCE: OnceCell<Regex> = OnceCell::new();
    let json_fence =
        RE_JSON_FENCE.get_or_init(|| Regex::new(r"(?s)```json\s*\n(.*?)\n\s*```").unwrap());
    let any_fence = RE_ANY_FENCE.get_or_init(|| Regex::new(r"(?s)```\s*\n(.*?)\n\s*```").unwrap());

    let mut regions = Vec::new();
    if let Some(caps) = json_fence.captures(text) {
        regions.push(caps[1].to_string());
    }
    if let Some(caps) = any_fence.captures(text) {
        regions.push(caps[1].to_string());
    }
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            regions.push(text[start..=end].to_string());
        }
    }
    regions
}

/// Scan brace nesting depth and collect every syntactically complete
/// `{...}` object carrying a `decision` key. Objects after the truncation
/// point never close, so they are simply not collected.
fn complete_objects(text: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        let candidate = &text[s..=idx];
                        if let Ok(Value::Object(map)) = serde_json::from_str(candidate) {
                            if map.contains_key("decision") {
                                objects.push(Value::Object(map));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    objects
}
