//! Data model shared by discovery, scoring, live validation, and reporting.
//!
//! Every result type carries the `(generator_id, parser_id)` pair it was
//! computed for. Results for different pairs are never merged.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::generator::{EventGenerator, GeneratedEvent};

/// Shape of raw event text, as produced by a generator or expected by a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFormat {
    /// Structured, JSON-like.
    Json,
    /// Line-oriented with a syslog priority prefix.
    Syslog,
    /// Delimited `key=value` pairs.
    KeyValue,
    /// Delimited columns.
    Csv,
    /// Could not be classified.
    Unknown,
    /// The generator failed when invoked.
    Error,
}

impl EventFormat {
    /// Parse an explicit format declaration (`"json"`, `"kv"`, ...).
    pub fn from_declared(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" | "structured" => Some(Self::Json),
            "syslog" | "line" => Some(Self::Syslog),
            "kv" | "keyvalue" | "key_value" | "key-value" => Some(Self::KeyValue),
            "csv" | "columnar" | "delimited" => Some(Self::Csv),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Syslog => "syslog",
            Self::KeyValue => "key_value",
            Self::Csv => "csv",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parser definition was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Remote,
}

/// A discovered generator with its sample-producing capability.
#[derive(Clone, Serialize)]
pub struct GeneratorArtifact {
    /// Canonical product identifier (e.g. `"acme_widget"`).
    pub id: String,
    /// Generator category (e.g. `"network_security"`).
    pub category: String,
    /// Format observed when the generator was probed during discovery.
    pub format_hint: EventFormat,
    /// Template path, when loaded from disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Load or probe failure, when `format_hint` is [`EventFormat::Error`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub generator: Option<Arc<dyn EventGenerator>>,
}

impl GeneratorArtifact {
    /// Whether the generator can take part in scoring.
    pub fn is_usable(&self) -> bool {
        self.format_hint != EventFormat::Error && self.generator.is_some()
    }
}

impl fmt::Debug for GeneratorArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorArtifact")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("format_hint", &self.format_hint)
            .field("path", &self.path)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A discovered parser definition. `raw_config` stays opaque until the
/// expectation extractor processes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserArtifact {
    pub id: String,
    pub source_kind: SourceKind,
    pub declared_format: EventFormat,
    /// Directory path or URL the configuration was read from.
    pub location: String,
    #[serde(skip)]
    pub raw_config: Option<String>,
}

/// One generated event, tagged for correlation.
#[derive(Debug, Clone, Serialize)]
pub struct SampleEvent {
    pub generator_id: String,
    /// Flattened (dotted) field paths and their values. Excludes the tag.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Rendered event text as it would be shipped, tag included.
    pub raw_text: String,
    /// Structured payload for JSON-like events, tag included.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
    pub tag: String,
}

impl SampleEvent {
    /// Build an untagged sample from a generator's output.
    pub fn new(generator_id: &str, generated: GeneratedEvent) -> Self {
        let fields = generated.flat_fields();
        let structured = generated.structured.then(|| generated.tree.clone());
        Self {
            generator_id: generator_id.to_string(),
            fields,
            raw_text: generated.raw_text,
            structured,
            tag: String::new(),
        }
    }

    /// Build a sample with `tag` embedded under `tag_field`.
    ///
    /// Structured events carry the tag as a top-level field; text events get
    /// a trailing `tag_field=tag` annotation.
    pub fn tagged(generator_id: &str, generated: GeneratedEvent, tag_field: &str, tag: &str) -> Self {
        let mut sample = Self::new(generator_id, generated);
        match sample.structured.as_mut() {
            Some(serde_json::Value::Object(map)) => {
                map.insert(tag_field.to_string(), serde_json::Value::String(tag.to_string()));
                sample.raw_text = serde_json::Value::Object(map.clone()).to_string();
            }
            _ => {
                sample.raw_text = format!("{} {tag_field}={tag}", sample.raw_text.trim_end());
            }
        }
        sample.tag = tag.to_string();
        sample
    }

    /// Case-normalized field names present in the sample.
    pub fn field_names(&self) -> BTreeSet<String> {
        self.fields
            .keys()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Fields a parser declares it will extract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExpectation {
    pub parser_id: String,
    /// Case-normalized, de-duplicated output field names.
    pub expected_fields: BTreeSet<String>,
    pub expected_format: EventFormat,
    pub ocsf_indicator_count: usize,
    /// Why the configuration could not be read, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FieldExpectation {
    pub fn empty(parser_id: &str) -> Self {
        Self {
            parser_id: parser_id.to_string(),
            expected_fields: BTreeSet::new(),
            expected_format: EventFormat::Unknown,
            ocsf_indicator_count: 0,
            error: None,
        }
    }

    pub fn is_schema_compliant(&self) -> bool {
        self.ocsf_indicator_count >= crate::expectation::SCHEMA_COMPLIANCE_MIN
    }
}

/// Static comparison of one sample against one parser expectation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub generator_id: String,
    pub parser_id: String,
    pub generator_format: EventFormat,
    pub parser_format: EventFormat,
    pub format_match: bool,
    /// Percentage in `[0, 100]`.
    pub coverage_pct: f64,
    pub matched_fields: Vec<String>,
    pub missing_fields: Vec<String>,
    pub extra_fields: Vec<String>,
    pub ocsf_indicator_count: usize,
}

/// Live validation state. `Failed` is terminal and skips polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Sent,
    Polling,
    Correlated,
    TimedOut,
    Failed,
    Scored,
}

/// Per-field extraction measured over correlated, retrieved events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub generator_id: String,
    pub parser_id: String,
    pub field: String,
    pub events_checked: usize,
    pub events_with_field: usize,
    /// Fraction in `[0, 1]`; zero when nothing was retrieved.
    pub extraction_rate: f64,
}

/// Outcome of one live validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub generator_id: String,
    pub parser_id: String,
    /// Every state the run passed through, in order.
    pub history: Vec<RunState>,
    pub sent: usize,
    pub retrieved: usize,
    /// `retrieved / sent`, reported apart from extraction rates.
    pub retrieval_rate: f64,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub polls: u32,
    pub records: Vec<ExtractionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn state(&self) -> RunState {
        self.history.last().copied().unwrap_or(RunState::Pending)
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.history.contains(&state)
    }

    pub fn timed_out(&self) -> bool {
        self.reached(RunState::TimedOut)
    }

    pub fn failed(&self) -> bool {
        self.state() == RunState::Failed
    }

    /// Mean extraction rate over expected fields, `None` without fields.
    pub fn mean_extraction_rate(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let total: f64 = self.records.iter().map(|r| r.extraction_rate).sum();
        Some(total / self.records.len() as f64)
    }

    /// Lowest per-field extraction rate, `None` without fields.
    pub fn min_extraction_rate(&self) -> Option<f64> {
        self.records.iter().map(|r| r.extraction_rate).reduce(f64::min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NoParser,
    FormatMismatch,
    LowCoverage,
    LowExtraction,
    GeneratorError,
    SubmissionFailed,
    ParserConfigError,
    LowSchemaCompliance,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoParser => "no_parser",
            Self::FormatMismatch => "format_mismatch",
            Self::LowCoverage => "low_coverage",
            Self::LowExtraction => "low_extraction",
            Self::GeneratorError => "generator_error",
            Self::SubmissionFailed => "submission_failed",
            Self::ParserConfigError => "parser_config_error",
            Self::LowSchemaCompliance => "low_schema_compliance",
        }
    }
}

/// Declaration order is rank order: `Critical` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessTier {
    Priority,
    Standard,
}

/// A ranked finding. Issues are produced once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub generator_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_id: Option<String>,
    pub kind: IssueKind,
    pub severity: Severity,
    pub business_tier: BusinessTier,
    pub description: String,
    pub suggested_fix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Scored,
    Error,
    TimedOut,
    Failed,
    NoParser,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scored => "scored",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
            Self::NoParser => "no_parser",
        }
    }
}

/// One line per attempted pair, so no pair is silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub generator_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_id: Option<String>,
    /// `"static"` or `"live"`.
    pub path: String,
    pub status: OutcomeStatus,
    pub detail: String,
}
