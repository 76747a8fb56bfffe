//! Issue aggregation.
//!
//! Turns static compatibility results and live run reports into a ranked,
//! deterministic list of [`Issue`]s, and lists an outcome for every pair that
//! was attempted. Results for different pairs are never combined.
//!
//! Severity for a pair is the first rule that matches:
//!
//! | Rule | Severity |
//! |---|---|
//! | no parser found | `critical` (priority tier) / `high` |
//! | format mismatch | `critical` (priority tier) / `high` |
//! | coverage or extraction below `very_low_pct` | `high` |
//! | coverage or extraction below `low_pct` | `medium` |
//! | fewer than 3 schema-compliance indicators | `low` |

use std::collections::BTreeMap;

use crate::catalog::{Catalog, Pairing};
use crate::config::{Thresholds, ValidatorConfig};
use crate::model::{
    BusinessTier, CompatibilityResult, FieldExpectation, Issue, IssueKind, OutcomeStatus, PairOutcome, RunReport,
    RunState, Severity,
};

/// Everything a single validation produced, read-only.
#[derive(Debug, Clone, Copy)]
pub struct Findings<'a> {
    pub catalog: &'a Catalog,
    pub pairings: &'a [Pairing],
    /// Keyed by parser id.
    pub expectations: &'a BTreeMap<String, FieldExpectation>,
    pub compatibility: &'a [CompatibilityResult],
    /// Generators that failed while producing the scoring sample, keyed by
    /// generator id.
    pub sample_errors: &'a BTreeMap<String, String>,
    pub runs: &'a [RunReport],
}

/// Rank issues for every pair in `findings`.
///
/// Output is sorted by severity rank then generator id; the sort is stable,
/// so issues for the same generator keep their rule order.
pub fn aggregate(findings: &Findings<'_>, config: &ValidatorConfig) -> Vec<Issue> {
    let mut issues = Vec::new();
    let compat: BTreeMap<(&str, &str), &CompatibilityResult> = findings
        .compatibility
        .iter()
        .map(|c| ((c.generator_id.as_str(), c.parser_id.as_str()), c))
        .collect();

    for pairing in findings.pairings {
        let tier = tier_of(config, &pairing.generator_id);

        if let Some(issue) = generator_issue(findings, pairing, tier) {
            issues.push(issue);
        }

        let Some(parser_id) = pairing.parser_id.as_deref() else {
            issues.push(Issue {
                generator_id: pairing.generator_id.clone(),
                parser_id: None,
                kind: IssueKind::NoParser,
                severity: tiered(tier),
                business_tier: tier,
                description: format!("no parser matches generator {}", pairing.generator_id),
                suggested_fix: "add a parser for this product or rename it to the generator's canonical id"
                    .to_string(),
            });
            continue;
        };

        if let Some(error) = findings.expectations.get(parser_id).and_then(|e| e.error.as_deref()) {
            issues.push(Issue {
                generator_id: pairing.generator_id.clone(),
                parser_id: Some(parser_id.to_string()),
                kind: IssueKind::ParserConfigError,
                severity: Severity::Medium,
                business_tier: tier,
                description: format!("parser {parser_id} configuration could not be read: {error}"),
                suggested_fix: "fix the parser configuration so it validates".to_string(),
            });
        }

        if let Some(result) = compat.get(&(pairing.generator_id.as_str(), parser_id)) {
            if let Some(issue) = static_issue(result, &config.thresholds, tier) {
                issues.push(issue);
            }
        }
    }

    for report in findings.runs {
        let tier = tier_of(config, &report.generator_id);
        if let Some(issue) = live_issue(report, &config.thresholds, tier) {
            issues.push(issue);
        }
    }

    for dropped in &findings.catalog.discovery_errors {
        let tier = tier_of(config, &dropped.id);
        let source = dropped
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| dropped.id.clone());
        issues.push(Issue {
            generator_id: dropped.id.clone(),
            parser_id: None,
            kind: IssueKind::GeneratorError,
            severity: Severity::High,
            business_tier: tier,
            description: format!("generator source {source} was not loaded: {}", dropped.error),
            suggested_fix: "give the template a unique product name and make sure it is readable".to_string(),
        });
    }

    issues.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.generator_id.cmp(&b.generator_id))
    });
    tracing::info!(issues = issues.len(), "aggregated issues");
    issues
}

/// One outcome line per attempted pair and path.
pub fn outcomes(findings: &Findings<'_>) -> Vec<PairOutcome> {
    let compat: BTreeMap<(&str, &str), &CompatibilityResult> = findings
        .compatibility
        .iter()
        .map(|c| ((c.generator_id.as_str(), c.parser_id.as_str()), c))
        .collect();

    let mut outcomes: Vec<PairOutcome> = findings
        .pairings
        .iter()
        .map(|pairing| {
            let outcome = |status, detail: String| PairOutcome {
                generator_id: pairing.generator_id.clone(),
                parser_id: pairing.parser_id.clone(),
                path: "static".to_string(),
                status,
                detail,
            };
            let Some(parser_id) = pairing.parser_id.as_deref() else {
                return outcome(OutcomeStatus::NoParser, "no parser matched".to_string());
            };
            if let Some(error) = generator_error(findings, &pairing.generator_id) {
                return outcome(OutcomeStatus::Error, format!("generator: {error}"));
            }
            if let Some(error) = findings.expectations.get(parser_id).and_then(|e| e.error.as_deref()) {
                return outcome(OutcomeStatus::Error, format!("parser: {error}"));
            }
            match compat.get(&(pairing.generator_id.as_str(), parser_id)) {
                Some(result) => outcome(
                    OutcomeStatus::Scored,
                    format!(
                        "coverage {:.1}%, format {}",
                        result.coverage_pct,
                        if result.format_match { "match" } else { "mismatch" }
                    ),
                ),
                None => outcome(OutcomeStatus::Error, "not scored".to_string()),
            }
        })
        .collect();

    outcomes.extend(findings.runs.iter().map(|report| {
        let (status, detail) = match report.state() {
            _ if report.failed() => (
                OutcomeStatus::Failed,
                report.error.clone().unwrap_or_else(|| "run failed".to_string()),
            ),
            _ if report.timed_out() => (
                OutcomeStatus::TimedOut,
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "no events retrieved before the deadline".to_string()),
            ),
            RunState::Scored => (
                OutcomeStatus::Scored,
                format!(
                    "retrieved {}/{}, mean extraction {:.1}%",
                    report.retrieved,
                    report.sent,
                    report.mean_extraction_rate().unwrap_or(1.0) * 100.0
                ),
            ),
            state => (OutcomeStatus::Error, format!("run stopped in state {state:?}")),
        };
        PairOutcome {
            generator_id: report.generator_id.clone(),
            parser_id: Some(report.parser_id.clone()),
            path: "live".to_string(),
            status,
            detail,
        }
    }));

    outcomes.extend(findings.catalog.discovery_errors.iter().map(|dropped| PairOutcome {
        generator_id: dropped.id.clone(),
        parser_id: None,
        path: "static".to_string(),
        status: OutcomeStatus::Error,
        detail: format!("discovery: {}", dropped.error),
    }));

    outcomes.sort_by(|a, b| {
        a.generator_id
            .cmp(&b.generator_id)
            .then_with(|| b.path.cmp(&a.path))
            .then_with(|| a.parser_id.cmp(&b.parser_id))
    });
    outcomes
}

fn tier_of(config: &ValidatorConfig, generator_id: &str) -> BusinessTier {
    if config.is_priority(generator_id) {
        BusinessTier::Priority
    } else {
        BusinessTier::Standard
    }
}

fn tiered(tier: BusinessTier) -> Severity {
    match tier {
        BusinessTier::Priority => Severity::Critical,
        BusinessTier::Standard => Severity::High,
    }
}

/// Severity for a percentage under the two thresholds, if it is under either.
fn below_threshold(pct: f64, thresholds: &Thresholds) -> Option<Severity> {
    if pct < thresholds.very_low_pct {
        Some(Severity::High)
    } else if pct < thresholds.low_pct {
        Some(Severity::Medium)
    } else {
        None
    }
}

fn generator_error<'a>(findings: &'a Findings<'_>, generator_id: &str) -> Option<&'a str> {
    if let Some(error) = findings.sample_errors.get(generator_id) {
        return Some(error.as_str());
    }
    let artifact = findings.catalog.generators.get(generator_id)?;
    if artifact.is_usable() {
        None
    } else {
        Some(artifact.error.as_deref().unwrap_or("generator is not usable"))
    }
}

fn generator_issue(findings: &Findings<'_>, pairing: &Pairing, tier: BusinessTier) -> Option<Issue> {
    let error = generator_error(findings, &pairing.generator_id)?;
    Some(Issue {
        generator_id: pairing.generator_id.clone(),
        parser_id: pairing.parser_id.clone(),
        kind: IssueKind::GeneratorError,
        severity: Severity::High,
        business_tier: tier,
        description: format!("generator {} could not produce an event: {error}", pairing.generator_id),
        suggested_fix: "fix the generator so it produces a sample without arguments".to_string(),
    })
}

fn static_issue(result: &CompatibilityResult, thresholds: &Thresholds, tier: BusinessTier) -> Option<Issue> {
    let issue = |kind, severity, description: String, suggested_fix: &str| Issue {
        generator_id: result.generator_id.clone(),
        parser_id: Some(result.parser_id.clone()),
        kind,
        severity,
        business_tier: tier,
        description,
        suggested_fix: suggested_fix.to_string(),
    };

    if !result.format_match {
        return Some(issue(
            IssueKind::FormatMismatch,
            tiered(tier),
            format!(
                "generator emits {} but parser {} expects {}",
                result.generator_format, result.parser_id, result.parser_format
            ),
            "align the parser's input format with the generator's output",
        ));
    }
    if let Some(severity) = below_threshold(result.coverage_pct, thresholds) {
        return Some(issue(
            IssueKind::LowCoverage,
            severity,
            format!(
                "coverage {:.1}%, missing: {}",
                result.coverage_pct,
                result.missing_fields.join(", ")
            ),
            "emit the missing fields from the generator or drop them from the parser",
        ));
    }
    if result.ocsf_indicator_count < crate::expectation::SCHEMA_COMPLIANCE_MIN {
        return Some(issue(
            IssueKind::LowSchemaCompliance,
            Severity::Low,
            format!(
                "parser {} maps {} of {} normalized schema fields",
                result.parser_id,
                result.ocsf_indicator_count,
                crate::expectation::SCHEMA_COMPLIANCE_MIN
            ),
            "map activity, class, category, severity and time fields to their normalized names",
        ));
    }
    None
}

fn live_issue(report: &RunReport, thresholds: &Thresholds, tier: BusinessTier) -> Option<Issue> {
    if report.failed() {
        return Some(Issue {
            generator_id: report.generator_id.clone(),
            parser_id: Some(report.parser_id.clone()),
            kind: IssueKind::SubmissionFailed,
            severity: Severity::High,
            business_tier: tier,
            description: format!(
                "live run failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ),
            suggested_fix: "check ingestion endpoint credentials and availability".to_string(),
        });
    }

    // Judged on the weakest field, not the mean.
    let rate = match report.min_extraction_rate() {
        Some(rate) => rate,
        None if report.retrieved == 0 => 0.0,
        None => return None,
    };
    let severity = below_threshold(rate * 100.0, thresholds)?;
    let description = if report.retrieved == 0 {
        format!(
            "none of {} tagged events were retrieved before the deadline",
            report.sent
        )
    } else {
        let mut weak: Vec<&str> = report
            .records
            .iter()
            .filter(|r| r.extraction_rate * 100.0 < thresholds.low_pct)
            .map(|r| r.field.as_str())
            .collect();
        weak.sort_unstable();
        format!(
            "lowest field extraction {:.1}% (mean {:.1}%) over {} retrieved events, weak fields: {}",
            rate * 100.0,
            report.mean_extraction_rate().unwrap_or(rate) * 100.0,
            report.retrieved,
            weak.join(", ")
        )
    };
    Some(Issue {
        generator_id: report.generator_id.clone(),
        parser_id: Some(report.parser_id.clone()),
        kind: IssueKind::LowExtraction,
        severity,
        business_tier: tier,
        description,
        suggested_fix: "compare the parser's extraction rules with what the query endpoint returns".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PairMethod;
    use crate::generator::{GeneratedEvent, Overrides};
    use crate::model::{EventFormat, ExtractionRecord, GeneratorArtifact};

    fn pairing(generator: &str, parser: Option<&str>) -> Pairing {
        Pairing {
            generator_id: generator.to_string(),
            parser_id: parser.map(str::to_string),
            method: if parser.is_some() {
                PairMethod::Direct
            } else {
                PairMethod::Unmatched
            },
            similarity: 1.0,
        }
    }

    fn compat(generator: &str, format_match: bool, coverage_pct: f64, indicators: usize) -> CompatibilityResult {
        CompatibilityResult {
            generator_id: generator.to_string(),
            parser_id: generator.to_string(),
            generator_format: EventFormat::Json,
            parser_format: if format_match {
                EventFormat::Json
            } else {
                EventFormat::Syslog
            },
            format_match,
            coverage_pct,
            matched_fields: Vec::new(),
            missing_fields: vec!["target".to_string()],
            extra_fields: Vec::new(),
            ocsf_indicator_count: indicators,
        }
    }

    fn config(priority: &[&str]) -> ValidatorConfig {
        ValidatorConfig {
            priority_vendors: priority.iter().map(|v| v.to_string()).collect(),
            ..ValidatorConfig::default()
        }
    }

    fn catalog(ids: &[&str]) -> Catalog {
        let mut catalog = Catalog::default();
        for id in ids {
            catalog.insert_generator(GeneratorArtifact {
                id: id.to_string(),
                category: "test".to_string(),
                format_hint: EventFormat::Json,
                path: None,
                error: None,
                generator: Some(std::sync::Arc::new(
                    |_: &Overrides| -> crate::error::Result<GeneratedEvent> {
                        Ok(GeneratedEvent::structured(serde_json::json!({})))
                    },
                )),
            });
        }
        catalog
    }

    fn timed_out_run(generator: &str) -> RunReport {
        RunReport {
            generator_id: generator.to_string(),
            parser_id: generator.to_string(),
            history: vec![
                RunState::Pending,
                RunState::Sent,
                RunState::Polling,
                RunState::TimedOut,
                RunState::Scored,
            ],
            sent: 3,
            retrieved: 0,
            retrieval_rate: 0.0,
            window_start_ms: 0,
            window_end_ms: 0,
            polls: 7,
            records: vec![ExtractionRecord {
                generator_id: generator.to_string(),
                parser_id: generator.to_string(),
                field: "user".to_string(),
                events_checked: 0,
                events_with_field: 0,
                extraction_rate: 0.0,
            }],
            error: None,
        }
    }

    #[test]
    fn format_mismatch_wins_over_coverage() {
        let catalog = catalog(&["acme_widget"]);
        let pairings = vec![pairing("acme_widget", Some("acme_widget"))];
        let compatibility = vec![compat("acme_widget", false, 10.0, 0)];
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &BTreeMap::new(),
            compatibility: &compatibility,
            sample_errors: &BTreeMap::new(),
            runs: &[],
        };

        let issues = aggregate(&findings, &config(&[]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::FormatMismatch);
        assert_eq!(issues[0].severity, Severity::High);

        let issues = aggregate(&findings, &config(&["acme"]));
        assert_eq!(issues[0].severity, Severity::Critical);
        assert_eq!(issues[0].business_tier, BusinessTier::Priority);
    }

    #[test]
    fn coverage_thresholds_and_schema_compliance() {
        let catalog = catalog(&["a_low", "b_very_low", "c_ok", "d_ok_few_indicators"]);
        let pairings: Vec<Pairing> = catalog.generators.keys().map(|id| pairing(id, Some(id))).collect();
        let compatibility = vec![
            compat("a_low", true, 75.0, 5),
            compat("b_very_low", true, 25.0, 5),
            compat("c_ok", true, 100.0, 5),
            compat("d_ok_few_indicators", true, 90.0, 2),
        ];
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &BTreeMap::new(),
            compatibility: &compatibility,
            sample_errors: &BTreeMap::new(),
            runs: &[],
        };

        let issues = aggregate(&findings, &config(&[]));
        let summary: Vec<(&str, IssueKind, Severity)> = issues
            .iter()
            .map(|i| (i.generator_id.as_str(), i.kind, i.severity))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("b_very_low", IssueKind::LowCoverage, Severity::High),
                ("a_low", IssueKind::LowCoverage, Severity::Medium),
                ("d_ok_few_indicators", IssueKind::LowSchemaCompliance, Severity::Low),
            ]
        );
    }

    #[test]
    fn missing_parser_and_timeout() {
        let catalog = catalog(&["acme_widget", "orphan"]);
        let pairings = vec![pairing("acme_widget", Some("acme_widget")), pairing("orphan", None)];
        let compatibility = vec![compat("acme_widget", true, 100.0, 4)];
        let runs = vec![timed_out_run("acme_widget")];
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &BTreeMap::new(),
            compatibility: &compatibility,
            sample_errors: &BTreeMap::new(),
            runs: &runs,
        };

        let issues = aggregate(&findings, &config(&[]));
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].generator_id, "acme_widget");
        assert_eq!(issues[0].kind, IssueKind::LowExtraction);
        assert!(issues[0].description.contains("none of 3"));
        assert_eq!(issues[1].kind, IssueKind::NoParser);
        assert!(issues[1].parser_id.is_none());

        let outcomes = outcomes(&findings);
        let statuses: Vec<(&str, &str, OutcomeStatus)> = outcomes
            .iter()
            .map(|o| (o.generator_id.as_str(), o.path.as_str(), o.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("acme_widget", "static", OutcomeStatus::Scored),
                ("acme_widget", "live", OutcomeStatus::TimedOut),
                ("orphan", "static", OutcomeStatus::NoParser),
            ]
        );
    }

    #[test]
    fn one_unextracted_field_is_flagged_despite_healthy_mean() {
        let catalog = catalog(&["acme_widget"]);
        let pairings = vec![pairing("acme_widget", Some("acme_widget"))];
        let mut run = timed_out_run("acme_widget");
        run.history = vec![
            RunState::Pending,
            RunState::Sent,
            RunState::Polling,
            RunState::Correlated,
            RunState::Scored,
        ];
        run.retrieved = 3;
        run.retrieval_rate = 1.0;
        run.records = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|field| {
                let with_field = if field == "e" { 0 } else { 3 };
                ExtractionRecord {
                    generator_id: "acme_widget".to_string(),
                    parser_id: "acme_widget".to_string(),
                    field: field.to_string(),
                    events_checked: 3,
                    events_with_field: with_field,
                    extraction_rate: with_field as f64 / 3.0,
                }
            })
            .collect();
        assert_eq!(run.mean_extraction_rate(), Some(0.8));

        let runs = vec![run];
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &BTreeMap::new(),
            compatibility: &[],
            sample_errors: &BTreeMap::new(),
            runs: &runs,
        };
        let issues = aggregate(&findings, &config(&[]));
        let live: Vec<&Issue> = issues.iter().filter(|i| i.kind == IssueKind::LowExtraction).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].severity, Severity::High);
        assert!(live[0].description.contains("weak fields: e"));
        assert!(live[0].description.contains("mean 80.0%"));
    }

    #[test]
    fn generator_and_parser_errors_are_reported() {
        let mut catalog = catalog(&["acme_widget"]);
        catalog.insert_generator(GeneratorArtifact {
            id: "broken".to_string(),
            category: "test".to_string(),
            format_hint: EventFormat::Error,
            path: None,
            error: Some("unknown placeholder".to_string()),
            generator: None,
        });
        let pairings = vec![pairing("acme_widget", Some("acme_widget")), pairing("broken", Some("broken"))];
        let mut expectations = BTreeMap::new();
        expectations.insert(
            "acme_widget".to_string(),
            FieldExpectation {
                error: Some("expected value at line 1".to_string()),
                ..FieldExpectation::empty("acme_widget")
            },
        );
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &expectations,
            compatibility: &[],
            sample_errors: &BTreeMap::new(),
            runs: &[],
        };

        let issues = aggregate(&findings, &config(&[]));
        let kinds: Vec<IssueKind> = issues.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![IssueKind::GeneratorError, IssueKind::ParserConfigError]);

        let outcomes = outcomes(&findings);
        assert!(outcomes.iter().all(|o| o.status == OutcomeStatus::Error));
        assert_eq!(outcomes.len(), 2);
    }

    #[test]
    fn discovery_errors_become_issues_and_outcomes() {
        let mut catalog = catalog(&["acme"]);
        catalog.discovery_errors.push(crate::catalog::DiscoveryError {
            id: "category:cloud".to_string(),
            path: Some(std::path::PathBuf::from("generators/cloud")),
            error: "permission denied".to_string(),
        });
        let pairings = vec![pairing("acme", Some("acme"))];
        let compatibility = vec![compat("acme", true, 100.0, 5)];
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &BTreeMap::new(),
            compatibility: &compatibility,
            sample_errors: &BTreeMap::new(),
            runs: &[],
        };

        let issues = aggregate(&findings, &config(&[]));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::GeneratorError);
        assert_eq!(issues[0].severity, Severity::High);
        assert!(issues[0].description.contains("generators/cloud"));
        assert!(issues[0].description.contains("permission denied"));

        let outcome_list = outcomes(&findings);
        let statuses: Vec<(&str, OutcomeStatus)> = outcome_list
            .iter()
            .map(|o| (o.generator_id.as_str(), o.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("acme", OutcomeStatus::Scored), ("category:cloud", OutcomeStatus::Error)]
        );
    }

    #[test]
    fn aggregation_is_deterministic() {
        let catalog = catalog(&["z_gen", "a_gen"]);
        let pairings = vec![pairing("z_gen", None), pairing("a_gen", None)];
        let findings = Findings {
            catalog: &catalog,
            pairings: &pairings,
            expectations: &BTreeMap::new(),
            compatibility: &[],
            sample_errors: &BTreeMap::new(),
            runs: &[],
        };
        let first = aggregate(&findings, &config(&["z"]));
        assert_eq!(first, aggregate(&findings, &config(&["z"])));
        assert_eq!(first[0].generator_id, "z_gen");
        assert_eq!(first[0].severity, Severity::Critical);
        assert_eq!(first[1].generator_id, "a_gen");
    }
}
