//! HTML report rendering and the kept-opportunities JSON artifact.
//!
//! Consumes the validated record list plus aggregate counters; everything
//! here is a stateless transformation of already-normalized data.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use html_escape::encode_text;
use tracing::{info, warn};

use crate::analyze::AnalyzedResult;
use crate::subject::Subject;

/// Partition analyzed records by directly re-testing the keep predicate
/// (decision KEEP and score at or above the threshold). Structurally
/// identical records land in exactly one partition.
pub fn partition_kept(
    analyzed: &[AnalyzedResult],
    min_score: u8,
) -> (Vec<&AnalyzedResult>, Vec<&AnalyzedResult>) {
    let keeps = |r: &AnalyzedResult| r.is_keep() && r.score >= min_score;
    let mut kept: Vec<&AnalyzedResult> = analyzed.iter().filter(|r| keeps(r)).collect();
    let killed: Vec<&AnalyzedResult> = analyzed.iter().filter(|r| !keeps(r)).collect();
    kept.sort_by(|a, b| b.score.cmp(&a.score));
    (kept, killed)
}

/// Render the subject's HTML report and write it under
/// `reports/<slug>/<date>.html`. Returns `None` when there is nothing to
/// report on.
pub fn generate_report(
    root: &Path,
    subject: &Subject,
    analyzed: &[AnalyzedResult],
    date: &str,
) -> Result<Option<PathBuf>> {
    if analyzed.is_empty() {
        warn!("no analyzed articles to report on");
        return Ok(None);
    }

    let (kept, killed) = partition_kept(analyzed, subject.config.min_opportunity_score);

    let template = std::fs::read_to_string(&subject.template_path)
        .with_context(|| format!("reading template {}", subject.template_path.display()))?;

    let html = render(&template, subject, analyzed.len(), &kept, &killed, date);

    let out_dir = root.join("reports").join(&subject.slug);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating report dir {}", out_dir.display()))?;
    let path = out_dir.join(format!("{date}.html"));
    std::fs::write(&path, html).with_context(|| format!("writing {}", path.display()))?;

    info!(
        path = %path.display(),
        kept = kept.len(),
        killed = killed.len(),
        "report saved"
    );
    Ok(Some(path))
}

fn render(
    template: &str,
    subject: &Subject,
    scanned: usize,
    kept: &[&AnalyzedResult],
    killed: &[&AnalyzedResult],
    date: &str,
) -> String {
    let mut classification_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for r in kept {
        *classification_counts
            .entry(r.classification.as_str())
            .or_default() += 1;
    }
    let breakdown = classification_counts
        .iter()
        .map(|(classification, count)| {
            let label = if classification.is_empty() {
                "(unclassified)"
            } else {
                classification
            };
            format!("<li>{}: {}</li>", encode_text(label), count)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let kept_rows = kept.iter().map(|r| kept_card(r)).collect::<Vec<_>>().join("\n");
    let killed_rows = killed
        .iter()
        .map(|r| killed_row(r))
        .collect::<Vec<_>>()
        .join("\n");

    let generated_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let replacements = [
        ("{{subject_name}}", encode_text(&subject.name).into_owned()),
        ("{{date}}", encode_text(date).into_owned()),
        ("{{scanned_count}}", scanned.to_string()),
        ("{{kept_count}}", kept.len().to_string()),
        ("{{killed_count}}", killed.len().to_string()),
        ("{{classification_breakdown}}", breakdown),
        ("{{kept_rows}}", kept_rows),
        ("{{killed_rows}}", killed_rows),
        ("{{generated_at}}", generated_at),
    ];

    let mut html = template.to_string();
    for (token, value) in replacements {
        html = html.replace(token, &value);
    }
    html
}

fn kept_card(r: &AnalyzedResult) -> String {
    let location = match (r.city.is_empty(), r.state.is_empty()) {
        (false, false) => format!("{}, {}", r.city, r.state),
        (false, true) => r.city.clone(),
        (true, false) => r.state.clone(),
        (true, true) => String::new(),
    };
    format!(
        concat!(
            "<article class=\"kept\">\n",
            "  <h3><a href=\"{url}\">{headline}</a></h3>\n",
            "  <p class=\"meta\">score {score}/10 · {classification} · {location}</p>\n",
            "  <p>{reasoning}</p>\n",
            "  <p class=\"next\">{stage} {timeline} {next_steps}</p>\n",
            "</article>"
        ),
        url = encode_text(&r.source_url),
        headline = encode_text(&r.headline),
        score = r.score,
        classification = encode_text(&r.classification),
        location = encode_text(&location),
        reasoning = encode_text(&r.reasoning),
        stage = encode_text(&r.stage),
        timeline = encode_text(&r.timeline),
        next_steps = encode_text(&r.next_steps),
    )
}

fn killed_row(r: &AnalyzedResult) -> String {
    format!(
        "<li>{} <span class=\"why\">{}</span></li>",
        encode_text(&r.headline),
        encode_text(&r.reasoning),
    )
}

/// Write the kept records as a JSON artifact for downstream research
/// tooling: `reports/<slug>/<date>.json`.
pub fn write_opportunities(
    root: &Path,
    subject: &Subject,
    kept: &[&AnalyzedResult],
    date: &str,
) -> Result<Option<PathBuf>> {
    if kept.is_empty() {
        return Ok(None);
    }

    let opportunities: Vec<serde_json::Value> = kept
        .iter()
        .map(|r| {
            let mut obj = serde_json::json!({
                "headline": r.headline,
                "source_url": r.source_url,
                "classification": r.classification,
                "score": r.score,
                "city": r.city,
                "state": r.state,
                "location_details": r.location_details,
                "stage": r.stage,
                "initiator": r.initiator,
                "timeline": r.timeline,
                "reasoning": r.reasoning,
                "next_steps": r.next_steps,
                "subject": subject.slug,
                "date": date,
            });
            // Subject-declared fields ride along with their defaults.
            if let Some(map) = obj.as_object_mut() {
                for extra in &subject.extra_fields {
                    let value = r
                        .extra
                        .get(&extra.field)
                        .cloned()
                        .unwrap_or_else(|| extra.default.clone());
                    map.insert(extra.field.clone(), value);
                }
            }
            obj
        })
        .collect();

    let out_dir = root.join("reports").join(&subject.slug);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("creating report dir {}", out_dir.display()))?;
    let path = out_dir.join(format!("{date}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(&opportunities)?)
        .with_context(|| format!("writing {}", path.display()))?;

    info!(path = %path.display(), count = kept.len(), "saved opportunities");
    Ok(Some(path))
}
