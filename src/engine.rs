//! Validation context and orchestration.
//!
//! A [`ValidationContext`] is built once per validation and owns everything
//! the components share: configuration, the catalog, the query rate limiter,
//! and the live endpoints. Nothing here is process-global.
//!
//! Static scoring fans out over a bounded rayon pool. Live runs are tokio
//! tasks bounded by a semaphore; all of them are joined before aggregation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rayon::prelude::*;
use tokio::sync::{Semaphore, watch};
use tracing::Instrument;

use crate::aggregate::{self, Findings};
use crate::catalog::{self, Catalog, Pairing};
use crate::client::{EventQuery, IngestSink};
use crate::config::ValidatorConfig;
use crate::error::{Error, Result};
use crate::expectation;
use crate::generator::Overrides;
use crate::live::{LiveSettings, LiveValidator};
use crate::model::{CompatibilityResult, FieldExpectation, RunReport, RunState, SampleEvent};
use crate::rate_limit::RateLimiter;
use crate::report::ResultSet;
use crate::scorer;

/// Output of the static path.
#[derive(Debug, Clone, Default)]
pub struct StaticScores {
    pub compatibility: Vec<CompatibilityResult>,
    /// Generators that failed while producing their scoring sample.
    pub sample_errors: BTreeMap<String, String>,
}

pub struct ValidationContext {
    config: ValidatorConfig,
    catalog: Catalog,
    limiter: Arc<RateLimiter>,
    live: Option<LiveValidator>,
}

impl ValidationContext {
    /// Context for a static-only validation.
    pub fn new(config: ValidatorConfig, catalog: Catalog) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            catalog,
            limiter,
            live: None,
        }
    }

    /// Enable live validation against the given endpoints.
    pub fn with_endpoints(mut self, ingest: Arc<dyn IngestSink>, query: Arc<dyn EventQuery>) -> Self {
        let settings = LiveSettings::from_config(&self.config);
        self.live = Some(LiveValidator::new(ingest, query, self.limiter.clone(), settings));
        self
    }

    /// Enable live validation against the HTTP endpoints in the configuration.
    #[cfg(feature = "http")]
    pub fn with_http_endpoints(self) -> Result<Self> {
        use std::time::Duration;

        use crate::client::{HttpIngest, HttpQuery};

        if !self.config.live_ready() {
            return Err(Error::Config(
                "live validation needs both ingest.url and query.url".to_string(),
            ));
        }
        let ingest = &self.config.ingest;
        let query = &self.config.query.endpoint;
        let ingest = HttpIngest::new(&ingest.url, &ingest.token, Duration::from_secs(ingest.timeout_secs))?;
        let query = HttpQuery::new(&query.url, &query.token, Duration::from_secs(query.timeout_secs))?;
        Ok(self.with_endpoints(Arc::new(ingest), Arc::new(query)))
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn pairings(&self) -> Vec<Pairing> {
        catalog::pair(&self.catalog, self.config.fuzzy_min_similarity)
    }

    /// Expectations for every parser some generator is paired with.
    pub fn expectations(&self, pairings: &[Pairing]) -> BTreeMap<String, FieldExpectation> {
        let wanted: BTreeSet<&str> = pairings.iter().filter_map(|p| p.parser_id.as_deref()).collect();
        wanted
            .into_iter()
            .filter_map(|id| self.catalog.parsers.get(id))
            .map(|parser| (parser.id.clone(), expectation::extract(parser)))
            .collect()
    }

    /// Score every pairing on a pool of `workers` threads.
    pub fn score_static(
        &self,
        pairings: &[Pairing],
        expectations: &BTreeMap<String, FieldExpectation>,
    ) -> Result<StaticScores> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .map_err(|e| Error::Config(format!("worker pool: {e}")))?;

        let results: Vec<Option<std::result::Result<CompatibilityResult, (String, String)>>> = pool
            .install(|| {
                pairings
                    .par_iter()
                    .map(|pairing| self.score_pair(pairing, expectations))
                    .collect()
            });

        let mut scores = StaticScores::default();
        for result in results.into_iter().flatten() {
            match result {
                Ok(compat) => scores.compatibility.push(compat),
                Err((generator_id, error)) => {
                    scores.sample_errors.insert(generator_id, error);
                }
            }
        }
        tracing::info!(
            scored = scores.compatibility.len(),
            sample_errors = scores.sample_errors.len(),
            "static scoring finished"
        );
        Ok(scores)
    }

    /// `None` when the pair cannot be scored for a reason the aggregator
    /// already sees (no parser, unusable generator, unreadable config).
    fn score_pair(
        &self,
        pairing: &Pairing,
        expectations: &BTreeMap<String, FieldExpectation>,
    ) -> Option<std::result::Result<CompatibilityResult, (String, String)>> {
        let parser_id = pairing.parser_id.as_deref()?;
        let generator = self.catalog.generators.get(&pairing.generator_id)?;
        let expectation = expectations.get(parser_id)?;
        if expectation.error.is_some() {
            return None;
        }
        let source = generator.generator.as_ref().filter(|_| generator.is_usable())?;

        match source.generate(&Overrides::new()) {
            Ok(event) => {
                let sample = SampleEvent::new(&generator.id, event);
                let result = scorer::score(
                    &sample,
                    expectation,
                    generator.format_hint,
                    expectation.expected_format,
                );
                tracing::debug!(
                    generator = %result.generator_id,
                    parser = %result.parser_id,
                    coverage = result.coverage_pct,
                    format_match = result.format_match,
                    "pair scored"
                );
                Some(Ok(result))
            }
            Err(e) => {
                tracing::warn!(generator = %generator.id, error = %e, "sample generation failed");
                Some(Err((generator.id.clone(), e.to_string())))
            }
        }
    }

    /// Run live validation for every scorable pairing, at most
    /// `live_concurrency` at a time, and wait for all of them.
    pub async fn run_live(
        &self,
        pairings: &[Pairing],
        expectations: &BTreeMap<String, FieldExpectation>,
        cancel: watch::Receiver<bool>,
    ) -> Vec<RunReport> {
        let Some(live) = &self.live else {
            return Vec::new();
        };
        let permits = Arc::new(Semaphore::new(self.config.live_concurrency));
        let mut tasks = Vec::new();

        for pairing in pairings {
            let Some(parser_id) = pairing.parser_id.as_deref() else {
                continue;
            };
            let (Some(generator), Some(expectation)) = (
                self.catalog.generators.get(&pairing.generator_id),
                expectations.get(parser_id),
            ) else {
                continue;
            };
            if !generator.is_usable() || expectation.error.is_some() {
                continue;
            }

            let live = live.clone();
            let generator = generator.clone();
            let expectation = expectation.clone();
            let cancel = cancel.clone();
            let permits = permits.clone();
            let span = tracing::info_span!("live_run", generator = %generator.id, parser = %expectation.parser_id);
            let handle = tokio::spawn(
                async move {
                    let _permit = permits.acquire_owned().await.ok();
                    live.run(&generator, &expectation, cancel).await
                }
                .instrument(span),
            );
            tasks.push((pairing.generator_id.clone(), parser_id.to_string(), handle));
        }

        let mut reports = Vec::with_capacity(tasks.len());
        for (generator_id, parser_id, handle) in tasks {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(generator = %generator_id, parser = %parser_id, error = %e, "live run aborted");
                    reports.push(aborted(generator_id, parser_id, e.to_string()));
                }
            }
        }
        reports
    }

    /// Discover pairings and score them statically.
    pub fn validate_static(&self) -> Result<ResultSet> {
        let pairings = self.pairings();
        let expectations = self.expectations(&pairings);
        let scores = self.score_static(&pairings, &expectations)?;
        Ok(self.assemble(&pairings, &expectations, scores, Vec::new()))
    }

    /// Static scoring followed by live validation when endpoints are set.
    pub async fn validate(&self, cancel: watch::Receiver<bool>) -> Result<ResultSet> {
        let pairings = self.pairings();
        let expectations = self.expectations(&pairings);
        let scores = self.score_static(&pairings, &expectations)?;
        let runs = self.run_live(&pairings, &expectations, cancel).await;
        Ok(self.assemble(&pairings, &expectations, scores, runs))
    }

    fn assemble(
        &self,
        pairings: &[Pairing],
        expectations: &BTreeMap<String, FieldExpectation>,
        scores: StaticScores,
        runs: Vec<RunReport>,
    ) -> ResultSet {
        let findings = Findings {
            catalog: &self.catalog,
            pairings,
            expectations,
            compatibility: &scores.compatibility,
            sample_errors: &scores.sample_errors,
            runs: &runs,
        };
        let issues = aggregate::aggregate(&findings, &self.config);
        let outcomes = aggregate::outcomes(&findings);
        ResultSet::new(
            self.catalog.generators.len(),
            self.catalog.parsers.len(),
            scores.compatibility,
            runs,
            issues,
            outcomes,
        )
    }
}

/// Report for a run whose task did not complete.
fn aborted(generator_id: String, parser_id: String, error: String) -> RunReport {
    RunReport {
        generator_id,
        parser_id,
        history: vec![RunState::Pending, RunState::Failed],
        sent: 0,
        retrieved: 0,
        retrieval_rate: 0.0,
        window_start_ms: 0,
        window_end_ms: 0,
        polls: 0,
        records: Vec::new(),
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratedEvent;
    use crate::model::{EventFormat, IssueKind, OutcomeStatus, ParserArtifact, SourceKind};

    fn parser(id: &str, config: &str) -> ParserArtifact {
        ParserArtifact {
            id: id.to_string(),
            source_kind: SourceKind::Local,
            declared_format: catalog::declared_format_of(Some(config)),
            location: format!("parsers/{id}"),
            raw_config: Some(config.to_string()),
        }
    }

    fn context() -> ValidationContext {
        let mut catalog = Catalog::default();
        catalog.register_generator(
            "acme_widget",
            "test",
            Arc::new(|_: &Overrides| -> Result<GeneratedEvent> {
                Ok(GeneratedEvent::structured(
                    serde_json::json!({"ts": "now", "user": "alice", "action": "login", "raw": "x"}),
                ))
            }),
        );
        catalog.register_generator(
            "flaky",
            "test",
            Arc::new(|_: &Overrides| -> Result<GeneratedEvent> {
                Err(Error::Discovery {
                    path: "flaky".into(),
                    reason: "boom".to_string(),
                })
            }),
        );
        catalog.insert_parser(parser(
            "acme_widget",
            r#"{"format": "json", "rewrites": [
                {"input": "a", "output": "ts"}, {"input": "b", "output": "user"},
                {"input": "c", "output": "action"}, {"input": "d", "output": "target"}]}"#,
        ));
        catalog.insert_parser(parser("flaky", r#"{"format": "json", "rewrites": []}"#));
        ValidationContext::new(ValidatorConfig::default(), catalog)
    }

    #[test]
    fn static_validation_scores_and_reports_every_pair() {
        let results = context().validate_static().unwrap();

        assert_eq!(results.compatibility.len(), 1);
        let compat = &results.compatibility[0];
        assert_eq!(compat.coverage_pct, 75.0);
        assert_eq!(compat.missing_fields, vec!["target"]);
        assert_eq!(compat.extra_fields, vec!["raw"]);
        assert_eq!(compat.generator_format, EventFormat::Json);

        let kinds: Vec<(&str, IssueKind)> = results
            .issues
            .iter()
            .map(|i| (i.generator_id.as_str(), i.kind))
            .collect();
        assert!(kinds.contains(&("acme_widget", IssueKind::LowCoverage)));
        assert!(kinds.contains(&("flaky", IssueKind::GeneratorError)));

        assert_eq!(results.outcomes.len(), 2);
        assert_eq!(results.outcomes[0].status, OutcomeStatus::Scored);
        assert_eq!(results.outcomes[1].status, OutcomeStatus::Error);
    }

    #[tokio::test]
    async fn without_endpoints_live_is_skipped() {
        let context = context();
        let (_tx, rx) = watch::channel(false);
        let results = context.validate(rx).await.unwrap();
        assert!(!context.is_live());
        assert!(results.runs.is_empty());
    }

    #[test]
    fn expectations_cover_only_paired_parsers() {
        let mut context = context();
        context.catalog.insert_parser(parser("unused", r#"{"rewrites": []}"#));
        let pairings = context.pairings();
        let expectations = context.expectations(&pairings);
        assert_eq!(
            expectations.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["acme_widget", "flaky"]
        );
    }
}
