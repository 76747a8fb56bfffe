//! Result set and human-readable report.
//!
//! The JSON result set is what downstream tooling diffs between runs, so
//! every list in it is sorted by generator id, then parser id. The Markdown
//! report is a projection of the result set and never recomputes anything.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{
    CompatibilityResult, ExtractionRecord, Issue, OutcomeStatus, PairOutcome, RunReport, Severity,
};

/// File name of the JSON result set inside the output directory.
pub const RESULTS_FILE: &str = "results.json";
/// File name of the Markdown report inside the output directory.
pub const REPORT_FILE: &str = "report.md";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub generators: usize,
    pub parsers: usize,
    /// Outcome lines per status (`scored`, `error`, ...).
    pub outcomes: BTreeMap<String, usize>,
    /// Issues per severity, every severity present.
    pub issues: BTreeMap<String, usize>,
    /// Mean static coverage over scored pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_coverage_pct: Option<f64>,
    /// Mean live retrieval rate over runs that were not `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_retrieval_rate: Option<f64>,
}

/// Everything one validation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSet {
    pub generated_at: DateTime<Utc>,
    pub compatibility: Vec<CompatibilityResult>,
    pub runs: Vec<RunReport>,
    pub extraction: Vec<ExtractionRecord>,
    pub issues: Vec<Issue>,
    pub outcomes: Vec<PairOutcome>,
    pub summary: Summary,
}

impl ResultSet {
    /// Assemble a result set. Issues and outcomes are kept in the order
    /// given; the other lists are sorted here.
    pub fn new(
        generators: usize,
        parsers: usize,
        mut compatibility: Vec<CompatibilityResult>,
        mut runs: Vec<RunReport>,
        issues: Vec<Issue>,
        outcomes: Vec<PairOutcome>,
    ) -> Self {
        compatibility.sort_by(|a, b| (&a.generator_id, &a.parser_id).cmp(&(&b.generator_id, &b.parser_id)));
        runs.sort_by(|a, b| (&a.generator_id, &a.parser_id).cmp(&(&b.generator_id, &b.parser_id)));
        let extraction: Vec<ExtractionRecord> = runs.iter().flat_map(|r| r.records.iter().cloned()).collect();

        let mut summary = Summary {
            generators,
            parsers,
            ..Summary::default()
        };
        for severity in Severity::ALL {
            let count = issues.iter().filter(|i| i.severity == severity).count();
            summary.issues.insert(severity.as_str().to_string(), count);
        }
        for outcome in &outcomes {
            *summary.outcomes.entry(outcome.status.as_str().to_string()).or_default() += 1;
        }
        summary.mean_coverage_pct = mean(compatibility.iter().map(|c| c.coverage_pct));
        summary.mean_retrieval_rate = mean(runs.iter().filter(|r| !r.failed()).map(|r| r.retrieval_rate));

        Self {
            generated_at: Utc::now(),
            compatibility,
            runs,
            extraction,
            issues,
            outcomes,
            summary,
        }
    }

    /// Number of issues at `severity`.
    pub fn count(&self, severity: Severity) -> usize {
        self.summary.issues.get(severity.as_str()).copied().unwrap_or(0)
    }

    /// Write `results.json` and `report.md` into `dir`, creating it if needed.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_file(&dir.join(RESULTS_FILE), &json)?;
        write_file(&dir.join(REPORT_FILE), &render_markdown(self))?;
        tracing::info!(dir = %dir.display(), "results written");
        Ok(())
    }

    /// Read a result set written by [`ResultSet::write`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Render the Markdown report.
pub fn render_markdown(results: &ResultSet) -> String {
    let mut out = String::new();
    let s = &results.summary;

    writeln!(out, "# Parser compatibility report").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "Generated {}", results.generated_at.to_rfc3339()).unwrap();
    writeln!(out).unwrap();
    writeln!(out, "- Generators: {}", s.generators).unwrap();
    writeln!(out, "- Parsers: {}", s.parsers).unwrap();
    if let Some(pct) = s.mean_coverage_pct {
        writeln!(out, "- Mean static coverage: {pct:.1}%").unwrap();
    }
    if let Some(rate) = s.mean_retrieval_rate {
        writeln!(out, "- Mean live retrieval: {:.1}%", rate * 100.0).unwrap();
    }

    writeln!(out).unwrap();
    writeln!(out, "## Issues").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "| Severity | Count |").unwrap();
    writeln!(out, "|---|---|").unwrap();
    for severity in Severity::ALL {
        writeln!(out, "| {} | {} |", severity.as_str(), results.count(severity)).unwrap();
    }

    if !results.issues.is_empty() {
        writeln!(out).unwrap();
        writeln!(out, "| Severity | Tier | Generator | Parser | Kind | Description | Suggested fix |").unwrap();
        writeln!(out, "|---|---|---|---|---|---|---|").unwrap();
        for issue in &results.issues {
            writeln!(
                out,
                "| {} | {:?} | {} | {} | {} | {} | {} |",
                issue.severity.as_str(),
                issue.business_tier,
                issue.generator_id,
                issue.parser_id.as_deref().unwrap_or("-"),
                issue.kind.as_str(),
                cell(&issue.description),
                cell(&issue.suggested_fix),
            )
            .unwrap();
        }
    }

    writeln!(out).unwrap();
    writeln!(out, "## Pairs").unwrap();
    writeln!(out).unwrap();
    for status in [
        OutcomeStatus::Scored,
        OutcomeStatus::Error,
        OutcomeStatus::TimedOut,
        OutcomeStatus::Failed,
        OutcomeStatus::NoParser,
    ] {
        let n = s.outcomes.get(status.as_str()).copied().unwrap_or(0);
        if n > 0 {
            writeln!(out, "- {}: {n}", status.as_str()).unwrap();
        }
    }
    writeln!(out).unwrap();
    for outcome in &results.outcomes {
        writeln!(
            out,
            "- `{}` -> `{}` [{}] **{}**: {}",
            outcome.generator_id,
            outcome.parser_id.as_deref().unwrap_or("-"),
            outcome.path,
            outcome.status.as_str(),
            outcome.detail,
        )
        .unwrap();
    }

    out
}

/// Keep a value on one table row.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

/// Write content to a file, creating parent directories as needed.
fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::Write {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, content).map_err(|e| Error::Write {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BusinessTier, EventFormat, IssueKind};

    fn sample() -> ResultSet {
        let compat = |generator: &str, pct: f64| CompatibilityResult {
            generator_id: generator.to_string(),
            parser_id: generator.to_string(),
            generator_format: EventFormat::Json,
            parser_format: EventFormat::Json,
            format_match: true,
            coverage_pct: pct,
            matched_fields: Vec::new(),
            missing_fields: Vec::new(),
            extra_fields: Vec::new(),
            ocsf_indicator_count: 4,
        };
        let issues = vec![Issue {
            generator_id: "zeta_fw".to_string(),
            parser_id: Some("zeta_fw".to_string()),
            kind: IssueKind::LowCoverage,
            severity: Severity::Medium,
            business_tier: BusinessTier::Standard,
            description: "coverage 60.0%, missing: a|b".to_string(),
            suggested_fix: "add fields".to_string(),
        }];
        let outcomes = vec![
            PairOutcome {
                generator_id: "acme_widget".to_string(),
                parser_id: Some("acme_widget".to_string()),
                path: "static".to_string(),
                status: OutcomeStatus::Scored,
                detail: "coverage 100.0%, format match".to_string(),
            },
            PairOutcome {
                generator_id: "zeta_fw".to_string(),
                parser_id: Some("zeta_fw".to_string()),
                path: "static".to_string(),
                status: OutcomeStatus::Scored,
                detail: "coverage 60.0%, format match".to_string(),
            },
        ];
        ResultSet::new(
            2,
            2,
            vec![compat("zeta_fw", 60.0), compat("acme_widget", 100.0)],
            Vec::new(),
            issues,
            outcomes,
        )
    }

    #[test]
    fn summary_counts_every_severity() {
        let results = sample();
        assert_eq!(results.summary.issues.len(), 4);
        assert_eq!(results.count(Severity::Medium), 1);
        assert_eq!(results.count(Severity::Critical), 0);
        assert_eq!(results.summary.outcomes["scored"], 2);
        assert_eq!(results.summary.mean_coverage_pct, Some(80.0));
        assert_eq!(results.summary.mean_retrieval_rate, None);
        assert_eq!(results.compatibility[0].generator_id, "acme_widget");
    }

    #[test]
    fn markdown_lists_every_pair() {
        let md = render_markdown(&sample());
        assert!(md.contains("| medium | 1 |"));
        assert!(md.contains("| critical | 0 |"));
        assert!(md.contains("missing: a\\|b"));
        assert!(md.contains("`acme_widget` -> `acme_widget` [static] **scored**"));
        assert!(md.contains("`zeta_fw` -> `zeta_fw` [static] **scored**"));
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let results = sample();
        results.write(&out).unwrap();

        assert!(out.join(REPORT_FILE).exists());
        let loaded = ResultSet::load(&out.join(RESULTS_FILE)).unwrap();
        assert_eq!(loaded.summary, results.summary);
        assert_eq!(loaded.issues, results.issues);
    }
}
