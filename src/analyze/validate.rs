//! Normalize loosely-typed parser output into validated records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Base fields carried by every record regardless of subject; all default
/// to the empty string (score defaults to 0 and is handled separately).
const BASE_STRING_FIELDS: &[&str] = &[
    "classification",
    "city",
    "state",
    "location_details",
    "initiator",
    "stage",
    "timeline",
    "reasoning",
    "source_url",
    "next_steps",
];

/// A validated classification record. Subject-declared fields and any
/// passthrough keys from the model (`title`, `url`, …) live in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedResult {
    pub decision: String,
    pub headline: String,
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub score: u8,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub location_details: String,
    #[serde(default)]
    pub initiator: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub timeline: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub next_steps: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalyzedResult {
    pub fn is_keep(&self) -> bool {
        self.decision == "KEEP"
    }
}

/// Per-field defaults: the fixed base set merged with subject-declared
/// `(field, default)` pairs at configuration-load time.
#[derive(Debug, Clone, Default)]
pub struct FieldDefaults {
    fields: Vec<(String, Value)>,
}

impl FieldDefaults {
    pub fn base() -> Self {
        let mut defaults = Self::default();
        for field in BASE_STRING_FIELDS {
            defaults.set(field, Value::String(String::new()));
        }
        defaults.set("score", json!(0));
        defaults
    }

    /// Add or override one default. Later declarations win, so a subject
    /// can re-default a base field.
    pub fn set(&mut self, field: &str, default: Value) {
        if let Some(entry) = self.fields.iter_mut().find(|(name, _)| name == field) {
            entry.1 = default;
        } else {
            self.fields.push((field.to_string(), default));
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Enforce required fields, fill defaults, normalize and clamp values.
/// Candidates are dropped, never synthesized: the output is at most as
/// long as the input.
pub fn validate_results(candidates: Vec<Value>, defaults: &FieldDefaults) -> Vec<AnalyzedResult> {
    let total = candidates.len();
    let mut valid = Vec::with_capacity(total);

    for candidate in candidates {
        let Value::Object(mut map) = candidate else {
            continue;
        };

        // The model sometimes answers with `title` where we asked for
        // `headline`; accept either.
        if !map.contains_key("headline") {
            if let Some(title) = map.get("title").cloned() {
                map.insert("headline".to_string(), title);
            }
        }

        if !map.contains_key("decision") || !map.contains_key("headline") {
            warn!("dropping result missing decision/headline");
            continue;
        }

        for (field, default) in defaults.iter() {
            map.entry(field.to_string()).or_insert_with(|| default.clone());
        }

        let decision = value_to_string(&map["decision"]).to_uppercase();
        map.insert("decision".to_string(), Value::String(decision));
        let headline = value_to_string(&map["headline"]);
        map.insert("headline".to_string(), Value::String(headline));

        let score = map.get("score").map(coerce_score).unwrap_or(0);
        map.insert("score".to_string(), json!(score));

        let source_url_empty = map
            .get("source_url")
            .map(|v| value_to_string(v).is_empty())
            .unwrap_or(true);
        if source_url_empty {
            if let Some(url) = map.get("url") {
                map.insert("source_url".to_string(), Value::String(value_to_string(url)));
            }
        }

        for field in BASE_STRING_FIELDS {
            if let Some(v) = map.get(*field) {
                if !v.is_string() {
                    let coerced = Value::String(value_to_string(v));
                    map.insert((*field).to_string(), coerced);
                }
            }
        }

        match serde_json::from_value::<AnalyzedResult>(Value::Object(map)) {
            Ok(result) => valid.push(result),
            Err(e) => warn!(error = %e, "dropping result that failed normalization"),
        }
    }

    info!(accepted = valid.len(), received = total, "validated results");
    valid
}

/// Integer JSON numbers pass through, float numbers truncate, integer
/// strings parse; everything else is 0. Always clamped to 0..=10.
fn coerce_score(value: &Value) -> u8 {
    let raw = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                f.trunc() as i64
            } else {
                0
            }
        }
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    raw.clamp(0, 10) as u8
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate_one(v: Value) -> Option<AnalyzedResult> {
        validate_results(vec![v], &FieldDefaults::base()).into_iter().next()
    }

    #[test]
    fn decision_is_uppercased_and_score_clamped() {
        let r = validate_one(json!({"decision":"keep","headline":"X","score":15})).unwrap();
        assert_eq!(r.decision, "KEEP");
        assert_eq!(r.headline, "X");
        assert_eq!(r.score, 10);
    }

    #[test]
    fn non_integer_scores_normalize_to_zero() {
        for score in [json!("n/a"), json!(null), json!("7.5")] {
            let r = validate_one(json!({"decision":"KILL","headline":"h","score":score})).unwrap();
            assert_eq!(r.score, 0, "score input {score:?}");
        }
    }

    #[test]
    fn integer_strings_and_float_numbers_coerce() {
        let r = validate_one(json!({"decision":"KEEP","headline":"h","score":"7"})).unwrap();
        assert_eq!(r.score, 7);
        let r = validate_one(json!({"decision":"KEEP","headline":"h","score":7.9})).unwrap();
        assert_eq!(r.score, 7);
        let r = validate_one(json!({"decision":"KEEP","headline":"h","score":-3})).unwrap();
        assert_eq!(r.score, 0);
    }

    #[test]
    fn title_substitutes_for_missing_headline() {
        let r = validate_one(json!({"decision":"KEEP","title":"From Title"})).unwrap();
        assert_eq!(r.headline, "From Title");
    }

    #[test]
    fn missing_required_fields_drop_the_candidate() {
        assert!(validate_one(json!({"headline":"no decision"})).is_none());
        assert!(validate_one(json!({"decision":"KEEP"})).is_none());
        assert!(validate_one(json!("not an object")).is_none());
    }

    #[test]
    fn source_url_backfills_from_url() {
        let r = validate_one(json!({
            "decision":"KEEP","headline":"h","url":"https://a.example/x"
        }))
        .unwrap();
        assert_eq!(r.source_url, "https://a.example/x");
    }

    #[test]
    fn subject_defaults_merge_over_base() {
        let mut defaults = FieldDefaults::base();
        defaults.set("acreage", json!("unknown"));
        let out = validate_results(
            vec![json!({"decision":"KEEP","headline":"h"})],
            &defaults,
        );
        assert_eq!(out[0].extra["acreage"], json!("unknown"));
        assert_eq!(out[0].classification, "");
    }

    #[test]
    fn output_never_exceeds_input() {
        let out = validate_results(
            vec![
                json!({"decision":"KEEP","headline":"a"}),
                json!(42),
                json!({"no":"fields"}),
            ],
            &FieldDefaults::base(),
        );
        assert_eq!(out.len(), 1);
    }
}
