//! Artifact discovery: generator templates and parser configurations on
//! disk, plus generators registered in code.
//!
//! Layout:
//!
//! ```text
//! generators/<category>/<name>.json     one template per product
//! parsers/<name>/parser.json            one configuration per product
//! ```
//!
//! Every generator is invoked once during discovery to classify its output
//! format. Failures are recorded on the artifact, never raised, so one bad
//! template cannot stop a scan of hundreds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::expectation;
use crate::fuzzy;
use crate::generator::{EventGenerator, GeneratedEvent, KV_TOKEN, Overrides, TemplateGenerator};
use crate::model::{EventFormat, GeneratorArtifact, ParserArtifact, SourceKind};

/// Category used for templates placed directly in the generator root.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Configuration file names tried in each parser directory, in order.
const PARSER_CONFIG_NAMES: &[&str] = &["parser.json", "config.json"];

static SYSLOG_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<\d{1,3}>").expect("valid regex"));

/// All generators and parsers known to one validation run.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    pub generators: BTreeMap<String, GeneratorArtifact>,
    pub parsers: BTreeMap<String, ParserArtifact>,
    /// Generators that could not be added, in discovery order.
    pub discovery_errors: Vec<DiscoveryError>,
}

/// A generator source that never made it into the catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryError {
    /// Generator id, or `category:<name>` for an unreadable category.
    pub id: String,
    pub path: Option<PathBuf>,
    pub error: String,
}

impl Catalog {
    /// Scan both namespaces. Fails only when a namespace root itself cannot
    /// be listed; individual artifacts degrade instead.
    pub fn discover(generator_root: &Path, parser_root: &Path) -> Result<Self> {
        let mut catalog = Self::default();
        let (artifacts, errors) = discover_generators(generator_root)?;
        catalog.discovery_errors = errors;
        for artifact in artifacts {
            catalog.insert_generator(artifact);
        }
        for artifact in discover_parsers(parser_root)? {
            catalog.insert_parser(artifact);
        }
        tracing::info!(
            generators = catalog.generators.len(),
            parsers = catalog.parsers.len(),
            discovery_errors = catalog.discovery_errors.len(),
            "catalog discovered"
        );
        Ok(catalog)
    }

    /// Register a generator implemented in code. It is probed immediately.
    pub fn register_generator(
        &mut self,
        name: &str,
        category: &str,
        generator: Arc<dyn EventGenerator>,
    ) -> &GeneratorArtifact {
        let id = canonical_id(name, "_generator");
        let artifact = probe(id.clone(), category.to_string(), None, generator);
        self.generators.insert(id.clone(), artifact);
        &self.generators[&id]
    }

    /// Add a generator artifact. A second artifact for the same id is
    /// renamed to `<id>_<category>`; if that is taken too it is recorded as
    /// a discovery error.
    pub fn insert_generator(&mut self, mut artifact: GeneratorArtifact) {
        if self.generators.contains_key(&artifact.id) {
            let renamed = format!("{}_{}", artifact.id, canonical_id(&artifact.category, ""));
            if self.generators.contains_key(&renamed) {
                tracing::warn!(id = %artifact.id, path = ?artifact.path, "duplicate generator id");
                self.discovery_errors.push(DiscoveryError {
                    error: format!("generator id {} is already taken, as is {renamed}", artifact.id),
                    id: artifact.id,
                    path: artifact.path,
                });
                return;
            }
            tracing::warn!(id = %artifact.id, %renamed, path = ?artifact.path, "duplicate generator id renamed");
            artifact.id = renamed;
        }
        self.generators.insert(artifact.id.clone(), artifact);
    }

    /// Add a parser artifact. The first artifact for an id wins.
    pub fn insert_parser(&mut self, artifact: ParserArtifact) {
        if self.parsers.contains_key(&artifact.id) {
            tracing::warn!(id = %artifact.id, location = %artifact.location, "duplicate parser id ignored");
            return;
        }
        self.parsers.insert(artifact.id.clone(), artifact);
    }

    pub fn parser_ids(&self) -> Vec<&str> {
        self.parsers.keys().map(String::as_str).collect()
    }
}

/// Canonical product id: lower-case, `-`/`.`/whitespace unified to `_`,
/// and a trailing role suffix (`_generator`, `_parser`) removed.
pub fn canonical_id(name: &str, role_suffix: &str) -> String {
    let mut id: String = name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c == '-' || c == '.' || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    if id.len() > role_suffix.len() && id.ends_with(role_suffix) {
        id.truncate(id.len() - role_suffix.len());
    }
    id
}

/// Classify a generator's output format from what it produced.
pub fn classify(event: &GeneratedEvent) -> EventFormat {
    if event.structured {
        return EventFormat::Json;
    }
    let text = event.raw_text.trim();
    if text.starts_with('{') && serde_json::from_str::<serde_json::Value>(text).is_ok() {
        return EventFormat::Json;
    }
    if SYSLOG_PREFIX.is_match(text) {
        return EventFormat::Syslog;
    }
    if KV_TOKEN.find_iter(text).take(2).count() >= 2 {
        return EventFormat::KeyValue;
    }
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.split(',').count() >= 3 {
        return EventFormat::Csv;
    }
    EventFormat::Unknown
}

fn probe(
    id: String,
    category: String,
    path: Option<PathBuf>,
    generator: Arc<dyn EventGenerator>,
) -> GeneratorArtifact {
    let (format_hint, error) = match generator.generate(&Overrides::new()) {
        Ok(event) => (classify(&event), None),
        Err(e) => {
            tracing::warn!(generator = %id, error = %e, "generator failed when probed");
            (EventFormat::Error, Some(e.to_string()))
        }
    };
    GeneratorArtifact {
        id,
        category,
        format_hint,
        path,
        error,
        generator: Some(generator),
    }
}

fn list_dir(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root).map_err(|e| Error::Read {
        path: root.to_path_buf(),
        source: e,
    })?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    Ok(paths)
}

fn is_json(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "json")
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Load every template under `root`, one directory level per category.
/// Categories that cannot be listed come back as discovery errors.
pub fn discover_generators(root: &Path) -> Result<(Vec<GeneratorArtifact>, Vec<DiscoveryError>)> {
    let mut found = Vec::new();
    let mut errors = Vec::new();
    for entry in list_dir(root)? {
        if entry.is_dir() {
            let category = file_stem(&entry);
            match list_dir(&entry) {
                Ok(files) => {
                    for file in files.into_iter().filter(|p| is_json(p)) {
                        found.push(load_generator(&file, &category));
                    }
                }
                Err(e) => {
                    tracing::warn!(category = %category, error = %e, "unreadable category");
                    errors.push(DiscoveryError {
                        id: format!("category:{category}"),
                        path: Some(entry.clone()),
                        error: e.to_string(),
                    });
                }
            }
        } else if is_json(&entry) {
            found.push(load_generator(&entry, UNCATEGORIZED));
        }
    }
    Ok((found, errors))
}

fn load_generator(path: &Path, category: &str) -> GeneratorArtifact {
    let fallback_id = canonical_id(&file_stem(path), "_generator");
    match TemplateGenerator::load(path) {
        Ok(template) => {
            let id = template
                .product_slug()
                .map(|slug| canonical_id(&slug, "_generator"))
                .unwrap_or(fallback_id);
            probe(id, category.to_string(), Some(path.to_path_buf()), Arc::new(template))
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "generator template rejected");
            GeneratorArtifact {
                id: fallback_id,
                category: category.to_string(),
                format_hint: EventFormat::Error,
                path: Some(path.to_path_buf()),
                error: Some(e.to_string()),
                generator: None,
            }
        }
    }
}

/// Load every parser directory under `root`.
pub fn discover_parsers(root: &Path) -> Result<Vec<ParserArtifact>> {
    let mut found = Vec::new();
    for dir in list_dir(root)?.into_iter().filter(|p| p.is_dir()) {
        found.push(load_parser(&dir));
    }
    Ok(found)
}

fn load_parser(dir: &Path) -> ParserArtifact {
    let id = canonical_id(&file_stem(dir), "_parser");
    let raw_config = find_parser_config(dir).and_then(|path| match std::fs::read_to_string(&path) {
        Ok(raw) => Some(raw),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "parser configuration unreadable");
            None
        }
    });
    ParserArtifact {
        declared_format: declared_format_of(raw_config.as_deref()),
        id,
        source_kind: SourceKind::Local,
        location: dir.display().to_string(),
        raw_config,
    }
}

fn find_parser_config(dir: &Path) -> Option<PathBuf> {
    for name in PARSER_CONFIG_NAMES {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    list_dir(dir).ok()?.into_iter().find(|p| {
        p.is_file()
            && p.extension()
                .is_some_and(|ext| ext == "json" || ext == "conf")
    })
}

/// Declared format of a raw configuration, `Unknown` when absent or unreadable.
pub fn declared_format_of(raw: Option<&str>) -> EventFormat {
    raw.and_then(|raw| expectation::parse_config(raw).ok())
        .map(|config| expectation::declared_format(&config))
        .unwrap_or(EventFormat::Unknown)
}

/// How a generator was matched to a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairMethod {
    Direct,
    Fuzzy,
    Unmatched,
}

/// One generator and the parser chosen for it, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pairing {
    pub generator_id: String,
    pub parser_id: Option<String>,
    pub method: PairMethod,
    pub similarity: f64,
}

/// Pair every generator with a parser: same canonical id first, then the
/// best fuzzy candidate when it is an exact normalized match or at least
/// `min_similarity` similar.
pub fn pair(catalog: &Catalog, min_similarity: f64) -> Vec<Pairing> {
    let parser_ids = catalog.parser_ids();
    catalog
        .generators
        .keys()
        .map(|generator_id| {
            if catalog.parsers.contains_key(generator_id) {
                return Pairing {
                    generator_id: generator_id.clone(),
                    parser_id: Some(generator_id.clone()),
                    method: PairMethod::Direct,
                    similarity: 1.0,
                };
            }
            match fuzzy::best_match(generator_id, &parser_ids, min_similarity) {
                Some(m) => {
                    tracing::debug!(
                        generator = %generator_id,
                        parser = %m.candidate,
                        similarity = m.similarity,
                        "fuzzy pairing"
                    );
                    Pairing {
                        generator_id: generator_id.clone(),
                        parser_id: Some(m.candidate),
                        method: PairMethod::Fuzzy,
                        similarity: m.similarity,
                    }
                }
                None => Pairing {
                    generator_id: generator_id.clone(),
                    parser_id: None,
                    method: PairMethod::Unmatched,
                    similarity: 0.0,
                },
            }
        })
        .collect()
}
