//! Parser expectation extraction.
//!
//! A parser configuration is a JSON document declaring rewrite rules. The
//! declared output field names form the parser's expected field set. Three
//! rule schemas are recognised, and anything else is reported rather than
//! guessed at:
//!
//! 1. `rewrites[].output`, at top level and inside each `formats[]` entry
//! 2. `$name$` / `$name=pattern$` captures in `formats[].format` strings
//! 3. `mappings.mappings[].transformations[]` with `rename.to`, `copy.to`,
//!    or `constant.field`
//!
//! ```json
//! {
//!   "format": "kv",
//!   "formats": [{ "format": "$ts$ user=$user$", "rewrites": [{ "input": "user", "output": "actor.user.name" }] }],
//!   "mappings": { "mappings": [{ "transformations": [{ "rename": { "from": "act", "to": "activity_id" } }] }] }
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{EventFormat, FieldExpectation, ParserArtifact};

/// Cross-vendor OCSF field names counted as schema-compliance indicators.
pub const OCSF_INDICATORS: [&str; 9] = [
    "activity_id",
    "class_uid",
    "category_uid",
    "severity_id",
    "time",
    "actor",
    "src_endpoint",
    "dst_endpoint",
    "observables",
];

/// Indicator count at which a parser counts as schema-compliant.
pub const SCHEMA_COMPLIANCE_MIN: usize = 3;

/// Transformations that read or reshape fields without declaring one.
const PASSIVE_TRANSFORMS: &[&str] = &["cast", "drop", "filter", "lowercase", "uppercase", "trim"];

#[derive(Debug, Default, Deserialize)]
pub struct ParserConfig {
    /// Explicit input format declaration.
    #[serde(default, alias = "input_format")]
    pub format: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatRule>,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
    #[serde(default)]
    pub mappings: Option<MappingSet>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FormatRule {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub rewrites: Vec<RewriteRule>,
}

#[derive(Debug, Deserialize)]
pub struct RewriteRule {
    #[serde(default)]
    pub input: Option<String>,
    pub output: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MappingSet {
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Mapping {
    #[serde(default)]
    pub transformations: Vec<serde_json::Map<String, Value>>,
}

static CAPTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_.]*)[^$]*\$").expect("valid regex")
});
static JSON_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\{\s*"[^"]+"\s*:|parse\s*=\s*json)"#).expect("valid regex")
});
static SYSLOG_PRIORITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*<(\d{1,3}|\$[A-Za-z_][A-Za-z0-9_.]*\$)>").expect("valid regex")
});
static KV_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_.]*=\S").expect("valid regex"));

/// Parse a raw configuration document.
pub fn parse_config(raw: &str) -> Result<ParserConfig> {
    serde_json::from_str(raw).map_err(|e| Error::Extraction(e.to_string()))
}

/// Build the expectation for a parser. Never fails: malformed or missing
/// configuration yields an empty expectation with the reason recorded.
pub fn extract(parser: &ParserArtifact) -> FieldExpectation {
    let Some(raw) = parser.raw_config.as_deref() else {
        return FieldExpectation {
            error: Some("no readable configuration".to_string()),
            ..FieldExpectation::empty(&parser.id)
        };
    };

    let outcome = parse_config(raw).and_then(|config| {
        let fields = declared_fields(&config)?;
        Ok((fields, declared_format(&config)))
    });

    match outcome {
        Ok((expected_fields, expected_format)) => FieldExpectation {
            parser_id: parser.id.clone(),
            ocsf_indicator_count: ocsf_indicator_count(&expected_fields),
            expected_fields,
            expected_format,
            error: None,
        },
        Err(e) => {
            tracing::warn!(parser = %parser.id, error = %e, "parser configuration rejected");
            FieldExpectation {
                error: Some(e.to_string()),
                ..FieldExpectation::empty(&parser.id)
            }
        }
    }
}

/// Union of all declared output field names, case-normalized.
pub fn declared_fields(config: &ParserConfig) -> Result<BTreeSet<String>> {
    let mut fields = BTreeSet::new();
    let mut add = |name: &str| {
        let name = name.trim().trim_end_matches('.').to_lowercase();
        if !name.is_empty() && !name.starts_with('_') {
            fields.insert(name);
        }
    };

    for rule in &config.rewrites {
        add(&rule.output);
    }
    for format in &config.formats {
        for caps in CAPTURE.captures_iter(&format.format) {
            add(&caps[1]);
        }
        for rule in &format.rewrites {
            add(&rule.output);
        }
    }

    if let Some(set) = &config.mappings {
        for (m, mapping) in set.mappings.iter().enumerate() {
            for (t, transform) in mapping.transformations.iter().enumerate() {
                for (kind, body) in transform {
                    let target = match kind.as_str() {
                        "rename" | "copy" => body.get("to"),
                        "constant" => body.get("field"),
                        k if PASSIVE_TRANSFORMS.contains(&k) => continue,
                        other => {
                            return Err(Error::Extraction(format!(
                                "mappings[{m}].transformations[{t}]: unsupported transformation '{other}'"
                            )));
                        }
                    };
                    match target.and_then(Value::as_str) {
                        Some(name) => add(name),
                        None => {
                            return Err(Error::Extraction(format!(
                                "mappings[{m}].transformations[{t}]: '{kind}' has no output field"
                            )));
                        }
                    }
                }
            }
        }
    }

    Ok(fields)
}

/// Explicit declaration first, then sniffing over the format patterns.
pub fn declared_format(config: &ParserConfig) -> EventFormat {
    if let Some(declared) = config.format.as_deref().and_then(EventFormat::from_declared) {
        return declared;
    }
    sniff_format(config.formats.iter().map(|f| f.format.as_str()))
}

/// Classify format patterns: a JSON-shaped token means structured, a
/// syslog priority prefix means line-oriented, `key=value` tokens mean
/// delimited key-value. Checked in that order across all patterns.
pub fn sniff_format<'a>(patterns: impl IntoIterator<Item = &'a str> + Clone) -> EventFormat {
    let any = |re: &Regex| patterns.clone().into_iter().any(|p| re.is_match(p));
    if any(&*JSON_TOKEN) {
        EventFormat::Json
    } else if any(&*SYSLOG_PRIORITY) {
        EventFormat::Syslog
    } else if any(&*KV_PAIR) {
        EventFormat::KeyValue
    } else {
        EventFormat::Unknown
    }
}

/// Count distinct OCSF indicator names among declared fields. A nested
/// path such as `actor.user.name` counts for `actor`.
pub fn ocsf_indicator_count(fields: &BTreeSet<String>) -> usize {
    OCSF_INDICATORS
        .iter()
        .filter(|indicator| {
            fields.iter().any(|f| {
                f == *indicator
                    || f.strip_prefix(*indicator)
                        .is_some_and(|rest| rest.starts_with('.'))
            })
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;

    fn parser(raw: Option<&str>) -> ParserArtifact {
        ParserArtifact {
            id: "acme_widget".to_string(),
            source_kind: SourceKind::Local,
            declared_format: EventFormat::Unknown,
            location: "test".to_string(),
            raw_config: raw.map(str::to_string),
        }
    }

    #[test]
    fn collects_outputs_from_all_schemas() {
        let exp = extract(&parser(Some(
            r#"{
                "rewrites": [{"input": "a", "output": "Time"}],
                "formats": [{
                    "format": "$ts$ $_skip$ user=$actor.user.name$ $unmapped.{parse=json}$",
                    "rewrites": [{"input": "x", "output": "activity_id"}]
                }],
                "mappings": {"mappings": [{"transformations": [
                    {"rename": {"from": "sev", "to": "severity_id"}},
                    {"copy": {"from": "ip", "to": "src_endpoint.ip"}},
                    {"constant": {"value": 3002, "field": "class_uid"}},
                    {"cast": {"field": "port", "type": "int"}}
                ]}]}
            }"#,
        )));
        assert!(exp.error.is_none());
        let fields: Vec<&str> = exp.expected_fields.iter().map(String::as_str).collect();
        assert_eq!(
            fields,
            vec![
                "activity_id",
                "actor.user.name",
                "class_uid",
                "severity_id",
                "src_endpoint.ip",
                "time",
                "ts",
                "unmapped",
            ]
        );
        assert_eq!(exp.ocsf_indicator_count, 6);
        assert!(exp.is_schema_compliant());
    }

    #[test]
    fn fields_are_deduplicated_case_insensitively() {
        let exp = extract(&parser(Some(
            r#"{"rewrites": [{"output": "User"}, {"output": "user"}, {"output": " USER "}]}"#,
        )));
        assert_eq!(exp.expected_fields.len(), 1);
    }

    #[test]
    fn explicit_format_wins_over_sniffing() {
        let exp = extract(&parser(Some(
            r#"{"format": "csv", "formats": [{"format": "<$pri$>$msg$"}]}"#,
        )));
        assert_eq!(exp.expected_format, EventFormat::Csv);
    }

    #[test]
    fn sniffs_formats_in_order() {
        assert_eq!(sniff_format([r#"{"user": $user$}"#]), EventFormat::Json);
        assert_eq!(sniff_format(["$unmapped.{parse=json}$"]), EventFormat::Json);
        assert_eq!(sniff_format(["<$pri$>$ts$ host=$h$"]), EventFormat::Syslog);
        assert_eq!(sniff_format(["<134>$rest$"]), EventFormat::Syslog);
        assert_eq!(sniff_format(["src=$src$ dst=$dst$"]), EventFormat::KeyValue);
        assert_eq!(sniff_format(["$a$,$b$,$c$"]), EventFormat::Unknown);
        assert_eq!(sniff_format(Vec::<&str>::new()), EventFormat::Unknown);
    }

    #[test]
    fn malformed_json_degrades_to_empty_expectation() {
        let exp = extract(&parser(Some(r#"{"rewrites": [{"output": "a",}]"#)));
        assert!(exp.expected_fields.is_empty());
        assert_eq!(exp.expected_format, EventFormat::Unknown);
        assert!(exp.error.is_some());
    }

    #[test]
    fn unknown_transformation_is_rejected() {
        let exp = extract(&parser(Some(
            r#"{"mappings": {"mappings": [{"transformations": [{"explode": {"field": "x"}}]}]}}"#,
        )));
        assert!(exp.expected_fields.is_empty());
        assert!(exp.error.unwrap().contains("explode"));
    }

    #[test]
    fn missing_config_is_recorded() {
        let exp = extract(&parser(None));
        assert_eq!(exp.expected_format, EventFormat::Unknown);
        assert!(exp.error.is_some());
    }

    #[test]
    fn indicator_prefix_must_be_a_path_segment() {
        let fields: BTreeSet<String> = ["actors", "timezone", "actor.user", "time"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(ocsf_indicator_count(&fields), 2);
    }
}
