//! Static compatibility scoring: one sample against one parser expectation.
//!
//! Pure and deterministic. Field lists in the result are sorted, so
//! enumeration order of the inputs never shows in the output.

use std::collections::BTreeSet;

use crate::model::{CompatibilityResult, EventFormat, FieldExpectation, SampleEvent};

/// Formats agree when identical, or when the parser's format is unknown.
pub fn formats_compatible(generator_format: EventFormat, parser_format: EventFormat) -> bool {
    parser_format == EventFormat::Unknown || generator_format == parser_format
}

/// `100 * matched / expected`; 100 for an empty expectation.
pub fn coverage_pct(matched: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 100.0;
    }
    (100.0 * matched as f64 / expected as f64).clamp(0.0, 100.0)
}

/// Score a sample's fields against a parser's expected fields.
pub fn score(
    sample: &SampleEvent,
    expectation: &FieldExpectation,
    generator_format: EventFormat,
    parser_format: EventFormat,
) -> CompatibilityResult {
    let present = sample.field_names();
    let expected: BTreeSet<String> = expectation
        .expected_fields
        .iter()
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty())
        .collect();

    let matched: Vec<String> = expected.intersection(&present).cloned().collect();
    let missing: Vec<String> = expected.difference(&present).cloned().collect();
    let extra: Vec<String> = present.difference(&expected).cloned().collect();

    CompatibilityResult {
        generator_id: sample.generator_id.clone(),
        parser_id: expectation.parser_id.clone(),
        generator_format,
        parser_format,
        format_match: formats_compatible(generator_format, parser_format),
        coverage_pct: coverage_pct(matched.len(), expected.len()),
        matched_fields: matched,
        missing_fields: missing,
        extra_fields: extra,
        ocsf_indicator_count: expectation.ocsf_indicator_count,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    fn sample(fields: &[&str]) -> SampleEvent {
        SampleEvent {
            generator_id: "acme_widget".to_string(),
            fields: fields
                .iter()
                .map(|f| (f.to_string(), json!("v")))
                .collect::<BTreeMap<_, _>>(),
            raw_text: String::new(),
            structured: None,
            tag: String::new(),
        }
    }

    fn expectation(fields: &[&str]) -> FieldExpectation {
        FieldExpectation {
            expected_fields: fields.iter().map(|f| f.to_string()).collect(),
            ..FieldExpectation::empty("acme_widget")
        }
    }

    #[test]
    fn exact_match_is_full_coverage() {
        let result = score(
            &sample(&["ts", "user", "action"]),
            &expectation(&["ts", "user", "action"]),
            EventFormat::Json,
            EventFormat::Json,
        );
        assert_eq!(result.coverage_pct, 100.0);
        assert!(result.missing_fields.is_empty());
        assert!(result.extra_fields.is_empty());
        assert!(result.format_match);
    }

    #[test]
    fn partial_match_reports_missing_and_extra() {
        let result = score(
            &sample(&["ts", "user", "action", "raw"]),
            &expectation(&["ts", "user", "action", "target"]),
            EventFormat::Json,
            EventFormat::Json,
        );
        assert_eq!(result.coverage_pct, 75.0);
        assert_eq!(result.missing_fields, vec!["target"]);
        assert_eq!(result.extra_fields, vec!["raw"]);
        assert_eq!(result.matched_fields, vec!["action", "ts", "user"]);
    }

    #[test]
    fn format_mismatch_ignores_field_overlap() {
        let result = score(
            &sample(&["ts"]),
            &expectation(&["ts"]),
            EventFormat::Json,
            EventFormat::Syslog,
        );
        assert!(!result.format_match);
        assert_eq!(result.coverage_pct, 100.0);
    }

    #[test]
    fn unknown_parser_format_is_permissive() {
        assert!(formats_compatible(EventFormat::Csv, EventFormat::Unknown));
        assert!(!formats_compatible(EventFormat::Unknown, EventFormat::Csv));
    }

    #[test]
    fn empty_expectation_is_full_coverage() {
        let result = score(&sample(&["a"]), &expectation(&[]), EventFormat::Json, EventFormat::Json);
        assert_eq!(result.coverage_pct, 100.0);
        assert!(result.missing_fields.is_empty());
    }

    #[test]
    fn scoring_is_idempotent_and_order_independent() {
        let a = score(
            &sample(&["b", "a", "c"]),
            &expectation(&["c", "d"]),
            EventFormat::KeyValue,
            EventFormat::KeyValue,
        );
        let b = score(
            &sample(&["c", "a", "b"]),
            &expectation(&["d", "c"]),
            EventFormat::KeyValue,
            EventFormat::KeyValue,
        );
        assert_eq!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn field_names_are_case_normalized() {
        let result = score(
            &sample(&["User", "TS"]),
            &expectation(&["user", "ts"]),
            EventFormat::Json,
            EventFormat::Json,
        );
        assert_eq!(result.coverage_pct, 100.0);
    }

    #[test]
    fn coverage_is_bounded_and_full_only_without_missing() {
        let cases: &[(&[&str], &[&str])] = &[
            (&[], &["a"]),
            (&["a"], &["a", "b", "c"]),
            (&["a", "b", "c"], &["a"]),
            (&["x"], &[]),
        ];
        for (present, wanted) in cases {
            let r = score(&sample(present), &expectation(wanted), EventFormat::Json, EventFormat::Json);
            assert!((0.0..=100.0).contains(&r.coverage_pct));
            assert_eq!(r.coverage_pct == 100.0, r.missing_fields.is_empty());
        }
    }
}
