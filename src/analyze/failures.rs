//! Failure sink: unrecoverable batch payloads, kept for manual replay.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::ingest::types::Article;

/// Write the verbatim input article list of a failed batch under `dir`
/// (already namespaced by subject), named by timestamp. A counter suffix
/// keeps two failures within the same second from clobbering each other.
pub fn save_failed_batch(dir: &Path, articles: &[Article]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating failure sink dir {}", dir.display()))?;

    let stamp = chrono::Local::now().format("%Y-%m-%d_%H%M%S").to_string();
    let mut path = dir.join(format!("{stamp}.json"));
    let mut n = 1u32;
    while path.exists() {
        path = dir.join(format!("{stamp}-{n}.json"));
        n += 1;
    }

    let json = serde_json::to_string_pretty(articles)?;
    std::fs::write(&path, json)
        .with_context(|| format!("writing failed batch to {}", path.display()))?;
    info!(path = %path.display(), articles = articles.len(), "saved failed batch");
    Ok(path)
}
