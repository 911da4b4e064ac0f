//! Subject configuration: keywords, prompt, field declarations, pipeline
//! overrides.
//!
//! Each monitored subject lives under `subjects/<slug>/` with a
//! `subject.toml`, a `prompt.md` system prompt, and an optional
//! `report.html` template. Pipeline settings resolve global-defaults →
//! `config.toml` → subject overrides.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::analyze::validate::FieldDefaults;
use crate::retry::RetryPolicy;

pub const SUBJECTS_DIR: &str = "subjects";
pub const GLOBAL_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_TEMPLATE: &str = "templates/default_report.html";

/// Resolved pipeline settings for one run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: String,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub telegram_enabled: bool,
    pub max_articles_per_run: usize,
    pub min_opportunity_score: u8,
    pub days_lookback: u32,
    pub batch_size: usize,
    pub max_tokens: u32,
    pub batch_poll_interval_seconds: u64,
    pub batch_max_wait_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_retries: 3,
            retry_delay_seconds: 5,
            telegram_enabled: true,
            max_articles_per_run: 100,
            min_opportunity_score: 5,
            days_lookback: 1,
            batch_size: 25,
            max_tokens: 16_384,
            batch_poll_interval_seconds: 10,
            batch_max_wait_seconds: 3600,
        }
    }
}

impl PipelineConfig {
    pub fn classify_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            std::time::Duration::from_secs(self.retry_delay_seconds),
            2.0,
        )
    }
}

/// A subject-declared optional field and its default value.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtraField {
    pub field: String,
    #[serde(default = "empty_string_value")]
    pub default: Value,
}

fn empty_string_value() -> Value {
    Value::String(String::new())
}

/// Everything one pipeline run needs to know about a subject.
#[derive(Debug, Clone)]
pub struct Subject {
    pub slug: String,
    pub name: String,
    pub emoji: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub system_prompt: String,
    pub template_path: PathBuf,
    pub extra_fields: Vec<ExtraField>,
    pub config: PipelineConfig,
}

impl Subject {
    /// Base defaults merged with this subject's field declarations.
    pub fn field_defaults(&self) -> FieldDefaults {
        let mut defaults = FieldDefaults::base();
        for extra in &self.extra_fields {
            defaults.set(&extra.field, extra.default.clone());
        }
        defaults
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubjectFile {
    name: Option<String>,
    emoji: Option<String>,
    description: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    extra_fields: Vec<ExtraField>,

    // Pipeline overrides; anything unset falls back to the global config.
    model: Option<String>,
    max_retries: Option<u32>,
    retry_delay_seconds: Option<u64>,
    telegram_enabled: Option<bool>,
    max_articles_per_run: Option<usize>,
    min_opportunity_score: Option<u8>,
    days_lookback: Option<u32>,
    batch_size: Option<usize>,
    max_tokens: Option<u32>,
    batch_poll_interval_seconds: Option<u64>,
    batch_max_wait_seconds: Option<u64>,
}

/// Load the global `config.toml`; absent file means stock defaults.
fn load_global_config(root: &Path) -> PipelineConfig {
    let path = root.join(GLOBAL_CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable global config, using defaults");
                PipelineConfig::default()
            }
        },
        Err(_) => {
            warn!(path = %path.display(), "global config not found, using defaults");
            PipelineConfig::default()
        }
    }
}

/// Load one subject by slug.
pub fn load_subject(root: &Path, slug: &str) -> Result<Subject> {
    let subject_dir = root.join(SUBJECTS_DIR).join(slug);
    if !subject_dir.is_dir() {
        let available: Vec<String> = list_subjects(root)
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.slug)
            .collect();
        bail!(
            "subject '{slug}' not found; available subjects: {}",
            if available.is_empty() {
                "(none)".to_string()
            } else {
                available.join(", ")
            }
        );
    }

    let toml_path = subject_dir.join("subject.toml");
    let content = std::fs::read_to_string(&toml_path)
        .with_context(|| format!("reading {}", toml_path.display()))?;
    let file: SubjectFile =
        toml::from_str(&content).with_context(|| format!("parsing {}", toml_path.display()))?;

    let prompt_path = subject_dir.join("prompt.md");
    let system_prompt = std::fs::read_to_string(&prompt_path)
        .with_context(|| format!("reading {}", prompt_path.display()))?;

    let subject_template = subject_dir.join("report.html");
    let template_path = if subject_template.exists() {
        subject_template
    } else {
        root.join(DEFAULT_TEMPLATE)
    };

    let mut config = load_global_config(root);
    apply_overrides(&mut config, &file);

    Ok(Subject {
        slug: slug.to_string(),
        name: file.name.unwrap_or_else(|| slug.to_string()),
        emoji: file.emoji.unwrap_or_default(),
        description: file.description.unwrap_or_default(),
        keywords: file.keywords,
        system_prompt,
        template_path,
        extra_fields: file.extra_fields,
        config,
    })
}

fn apply_overrides(config: &mut PipelineConfig, file: &SubjectFile) {
    if let Some(v) = &file.model {
        config.model = v.clone();
    }
    if let Some(v) = file.max_retries {
        config.max_retries = v;
    }
    if let Some(v) = file.retry_delay_seconds {
        config.retry_delay_seconds = v;
    }
    if let Some(v) = file.telegram_enabled {
        config.telegram_enabled = v;
    }
    if let Some(v) = file.max_articles_per_run {
        config.max_articles_per_run = v;
    }
    if let Some(v) = file.min_opportunity_score {
        config.min_opportunity_score = v;
    }
    if let Some(v) = file.days_lookback {
        config.days_lookback = v;
    }
    if let Some(v) = file.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = file.max_tokens {
        config.max_tokens = v;
    }
    if let Some(v) = file.batch_poll_interval_seconds {
        config.batch_poll_interval_seconds = v;
    }
    if let Some(v) = file.batch_max_wait_seconds {
        config.batch_max_wait_seconds = v;
    }
}

#[derive(Debug, Clone)]
pub struct SubjectSummary {
    pub slug: String,
    pub name: String,
    pub description: String,
}

/// Enumerate available subjects, skipping `_`-prefixed scaffold dirs and
/// anything without a `subject.toml`.
pub fn list_subjects(root: &Path) -> Result<Vec<SubjectSummary>> {
    let dir = root.join(SUBJECTS_DIR);
    let mut subjects = Vec::new();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(subjects),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let slug = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if !path.is_dir() || slug.starts_with('_') {
            continue;
        }
        let toml_path = path.join("subject.toml");
        let Ok(content) = std::fs::read_to_string(&toml_path) else {
            continue;
        };
        let file: SubjectFile = match toml::from_str(&content) {
            Ok(f) => f,
            Err(e) => {
                warn!(slug, error = %e, "skipping subject with unparseable subject.toml");
                continue;
            }
        };
        subjects.push(SubjectSummary {
            name: file.name.unwrap_or_else(|| slug.clone()),
            description: file.description.unwrap_or_default(),
            slug,
        });
    }

    subjects.sort_by(|a, b| a.slug.cmp(&b.slug));
    Ok(subjects)
}
