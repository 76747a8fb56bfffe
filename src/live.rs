//! Live validation: send tagged events, poll until they come back parsed,
//! and measure which expected fields were actually extracted.
//!
//! ```text
//! PENDING -> SENT -> POLLING -> CORRELATED -> SCORED
//!    |                   \----> TIMED_OUT --/
//!    \--> FAILED   (generation or submission failure, no polling)
//! ```
//!
//! Each run owns its samples, backoff, and deadline. The only shared state
//! is the query rate limiter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::client::{EventQuery, IngestSink, QueryRequest, RetrievedEvent};
use crate::config::ValidatorConfig;
use crate::generator::Overrides;
use crate::model::{ExtractionRecord, FieldExpectation, GeneratorArtifact, RunReport, RunState, SampleEvent};
use crate::rate_limit::RateLimiter;

/// Upper bound on samples per run; tags are suffixed with a 3-digit index.
pub const MAX_SAMPLES: usize = 999;

/// Knobs for one live run.
#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub samples: usize,
    pub tag_field: String,
    pub deadline: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub jitter: f64,
    /// Subtracted from the run start to absorb clock drift.
    pub skew: Duration,
    pub max_results: usize,
}

impl LiveSettings {
    pub fn from_config(config: &ValidatorConfig) -> Self {
        Self {
            samples: config.samples_per_run.clamp(1, MAX_SAMPLES),
            tag_field: config.tag_field.clone(),
            deadline: Duration::from_secs(config.polling.deadline_secs),
            backoff_min: Duration::from_millis(config.polling.backoff_min_ms),
            backoff_max: Duration::from_millis(config.polling.backoff_max_ms),
            jitter: config.polling.jitter,
            skew: Duration::from_secs(config.polling.skew_secs),
            max_results: config.query.max_results,
        }
    }
}

/// Runs validations against one ingestion and one query endpoint.
#[derive(Clone)]
pub struct LiveValidator {
    ingest: Arc<dyn IngestSink>,
    query: Arc<dyn EventQuery>,
    limiter: Arc<RateLimiter>,
    settings: LiveSettings,
}

/// Mutable progress of one run, turned into a [`RunReport`] at the end.
struct Run {
    generator_id: String,
    parser_id: String,
    history: Vec<RunState>,
    samples: Vec<SampleEvent>,
    retrieved: Vec<RetrievedEvent>,
    window_start_ms: i64,
    window_end_ms: i64,
    polls: u32,
    error: Option<String>,
}

impl Run {
    fn advance(&mut self, state: RunState) {
        tracing::debug!(
            generator = %self.generator_id,
            parser = %self.parser_id,
            from = ?self.history.last(),
            to = ?state,
            "run state"
        );
        self.history.push(state);
    }

    fn fail(mut self, error: String) -> RunReport {
        tracing::warn!(generator = %self.generator_id, parser = %self.parser_id, %error, "run failed");
        self.error = Some(error);
        self.advance(RunState::Failed);
        self.into_report(Vec::new())
    }

    fn into_report(self, records: Vec<ExtractionRecord>) -> RunReport {
        let sent = self.samples.len();
        let retrieved = distinct_tags(&self.samples, &self.retrieved).len();
        RunReport {
            generator_id: self.generator_id,
            parser_id: self.parser_id,
            history: self.history,
            sent,
            retrieved,
            retrieval_rate: if sent == 0 { 0.0 } else { retrieved as f64 / sent as f64 },
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
            polls: self.polls,
            records,
            error: self.error,
        }
    }
}

enum PollEnd {
    AllRetrieved,
    Deadline,
    Cancelled,
    Fatal(String),
}

impl LiveValidator {
    pub fn new(
        ingest: Arc<dyn IngestSink>,
        query: Arc<dyn EventQuery>,
        limiter: Arc<RateLimiter>,
        settings: LiveSettings,
    ) -> Self {
        Self {
            ingest,
            query,
            limiter,
            settings,
        }
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    /// Drive one run to a terminal state. Never returns an error: every
    /// failure ends up in the report.
    pub async fn run(
        &self,
        generator: &GeneratorArtifact,
        expectation: &FieldExpectation,
        mut cancel: watch::Receiver<bool>,
    ) -> RunReport {
        let mut run = Run {
            generator_id: generator.id.clone(),
            parser_id: expectation.parser_id.clone(),
            history: vec![RunState::Pending],
            samples: Vec::new(),
            retrieved: Vec::new(),
            window_start_ms: 0,
            window_end_ms: 0,
            polls: 0,
            error: None,
        };

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        match self.generate_samples(generator, &run_id) {
            Ok(samples) => run.samples = samples,
            Err(e) => return run.fail(e),
        }

        let started_ms = chrono::Utc::now().timestamp_millis();
        run.window_start_ms = started_ms - self.settings.skew.as_millis() as i64;
        run.window_end_ms = started_ms;

        let submission = tokio::select! {
            result = self.ingest.submit(&expectation.parser_id, &run.samples, &self.settings.tag_field) => Some(result),
            _ = wait_cancelled(&mut cancel) => None,
        };
        match submission {
            Some(Ok(())) => run.advance(RunState::Sent),
            Some(Err(e)) => return run.fail(e.to_string()),
            None => {
                run.error = Some("cancelled during submission".to_string());
                run.advance(RunState::TimedOut);
                let records = score(&run, expectation);
                run.advance(RunState::Scored);
                return run.into_report(records);
            }
        }
        tracing::info!(
            generator = %run.generator_id,
            parser = %run.parser_id,
            run = %run_id,
            sent = run.samples.len(),
            "samples submitted"
        );

        run.advance(RunState::Polling);
        let end = self.poll(&mut run, &run_id, &mut cancel).await;
        match end {
            PollEnd::AllRetrieved | PollEnd::Deadline => {}
            PollEnd::Cancelled => run.error = Some("cancelled while polling".to_string()),
            PollEnd::Fatal(e) => run.error = Some(e),
        }

        if run.retrieved.is_empty() {
            run.advance(RunState::TimedOut);
        } else {
            run.advance(RunState::Correlated);
        }
        let records = score(&run, expectation);
        run.advance(RunState::Scored);

        let report = run.into_report(records);
        tracing::info!(
            generator = %report.generator_id,
            parser = %report.parser_id,
            retrieved = report.retrieved,
            sent = report.sent,
            polls = report.polls,
            state = ?report.history[report.history.len() - 2],
            "run finished"
        );
        report
    }

    fn generate_samples(&self, generator: &GeneratorArtifact, run_id: &str) -> Result<Vec<SampleEvent>, String> {
        let Some(source) = generator.generator.as_ref().filter(|_| generator.is_usable()) else {
            return Err(generator
                .error
                .clone()
                .unwrap_or_else(|| "generator is not usable".to_string()));
        };
        (0..self.settings.samples)
            .map(|i| {
                let tag = format!("{run_id}-{i:03}");
                source
                    .generate(&Overrides::new())
                    .map(|event| SampleEvent::tagged(&generator.id, event, &self.settings.tag_field, &tag))
                    .map_err(|e| e.to_string())
            })
            .collect()
    }

    /// Poll until every sample is back, the deadline passes, polling is
    /// cancelled, or the endpoint rejects the query outright.
    async fn poll(&self, run: &mut Run, run_id: &str, cancel: &mut watch::Receiver<bool>) -> PollEnd {
        let deadline = Instant::now() + self.settings.deadline;
        let mut backoff = Backoff::new(self.settings.backoff_min, self.settings.backoff_max, self.settings.jitter);

        loop {
            if *cancel.borrow() {
                return PollEnd::Cancelled;
            }
            if Instant::now() >= deadline {
                return PollEnd::Deadline;
            }

            let ready = tokio::select! {
                _ = self.limiter.acquire() => true,
                _ = tokio::time::sleep_until(deadline) => false,
                _ = wait_cancelled(cancel) => return PollEnd::Cancelled,
            };
            if !ready {
                return PollEnd::Deadline;
            }

            let now_ms = chrono::Utc::now().timestamp_millis();
            run.window_end_ms = now_ms;
            let request = QueryRequest::for_tags(&[run_id], run.window_start_ms, now_ms, self.settings.max_results);
            run.polls += 1;

            let outcome = tokio::select! {
                result = tokio::time::timeout_at(deadline, self.query.query(&request)) => match result {
                    Ok(result) => result,
                    Err(_) => return PollEnd::Deadline,
                },
                _ = wait_cancelled(cancel) => return PollEnd::Cancelled,
            };

            let interval = backoff.next_interval();
            match outcome {
                Ok(events) => {
                    let matched = correlate(&run.samples, events, run.window_start_ms);
                    merge(&run.samples, &mut run.retrieved, matched);
                    let found = distinct_tags(&run.samples, &run.retrieved).len();
                    tracing::debug!(attempt = run.polls, found, sent = run.samples.len(), "poll result");
                    if found == run.samples.len() {
                        return PollEnd::AllRetrieved;
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(attempt = run.polls, error = %e, "transient query failure");
                    if e.is_rate_limited() {
                        self.limiter.throttle(interval);
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt = run.polls, error = %e, "query rejected, polling aborted");
                    return PollEnd::Fatal(e.to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return PollEnd::Deadline;
            }
            let wake = (now + interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = wait_cancelled(cancel) => return PollEnd::Cancelled,
            }
        }
    }
}

/// Resolve when the run is cancelled. A dropped sender never cancels.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Keep events that carry one of the run's tags and were not indexed
/// before the run's window.
fn correlate(samples: &[SampleEvent], events: Vec<RetrievedEvent>, window_start_ms: i64) -> Vec<RetrievedEvent> {
    events
        .into_iter()
        .filter(|e| e.timestamp_ms().is_none_or(|ts| ts >= window_start_ms))
        .filter(|e| samples.iter().any(|s| e.contains_tag(&s.tag)))
        .collect()
}

/// Keep one event per sample tag across polls. A capped query can return a
/// different subset each time, so earlier matches are never replaced.
fn merge(samples: &[SampleEvent], kept: &mut Vec<RetrievedEvent>, fresh: Vec<RetrievedEvent>) {
    for event in fresh {
        let adds_tag = samples
            .iter()
            .any(|s| event.contains_tag(&s.tag) && !kept.iter().any(|k| k.contains_tag(&s.tag)));
        if adds_tag {
            kept.push(event);
        }
    }
}

fn distinct_tags<'a>(samples: &'a [SampleEvent], events: &[RetrievedEvent]) -> BTreeSet<&'a str> {
    samples
        .iter()
        .filter(|s| events.iter().any(|e| e.contains_tag(&s.tag)))
        .map(|s| s.tag.as_str())
        .collect()
}

/// Extraction rate per expected field over the correlated events only.
fn score(run: &Run, expectation: &FieldExpectation) -> Vec<ExtractionRecord> {
    let flattened: Vec<BTreeMap<String, serde_json::Value>> =
        run.retrieved.iter().map(RetrievedEvent::flat_attributes).collect();
    let checked = run.retrieved.len();

    expectation
        .expected_fields
        .iter()
        .map(|field| {
            let with_field = run
                .retrieved
                .iter()
                .zip(&flattened)
                .filter(|(event, flat)| event.has_field(flat, field))
                .count();
            ExtractionRecord {
                generator_id: run.generator_id.clone(),
                parser_id: run.parser_id.clone(),
                field: field.clone(),
                events_checked: checked,
                events_with_field: with_field,
                extraction_rate: if checked == 0 { 0.0 } else { with_field as f64 / checked as f64 },
            }
        })
        .collect()
}
