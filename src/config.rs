//! Validator configuration.
//!
//! Defaults cover a static-only run. A JSON file can override any field,
//! and the CLI layers flag/environment overrides on top before calling
//! [`ValidatorConfig::validate`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::RateLimitConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub ingest: EndpointConfig,
    pub query: QueryConfig,
    /// External parser repository searched by `resolve --remote`.
    pub remote: RemoteConfig,
    pub polling: PollingConfig,
    pub rate_limit: RateLimitConfig,
    pub thresholds: Thresholds,

    /// Tagged events sent per live run.
    pub samples_per_run: usize,
    /// Worker threads for static scoring.
    pub workers: usize,
    /// Live runs in flight at once.
    pub live_concurrency: usize,
    /// Lowest similarity accepted for a fuzzy generator/parser pairing.
    pub fuzzy_min_similarity: f64,
    /// Field name the correlation tag is embedded under.
    pub tag_field: String,
    /// Vendor slugs whose products form the high-priority business tier.
    pub priority_vendors: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            ingest: EndpointConfig::default(),
            query: QueryConfig::default(),
            remote: RemoteConfig::default(),
            polling: PollingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            thresholds: Thresholds::default(),
            samples_per_run: 3,
            workers: 8,
            live_concurrency: 4,
            fuzzy_min_similarity: 0.85,
            tag_field: "validation_tag".to_string(),
            priority_vendors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    /// Result cap per query.
    pub max_results: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            max_results: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(flatten)]
    pub endpoint: EndpointConfig,
    /// Listing pages walked per search.
    pub max_pages: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            max_pages: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub deadline_secs: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of each interval added as random jitter.
    pub jitter: f64,
    /// Clock drift allowance subtracted from the query window start.
    pub skew_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            deadline_secs: 120,
            backoff_min_ms: 1_000,
            backoff_max_ms: 15_000,
            jitter: 0.2,
            skew_secs: 300,
        }
    }
}

/// Coverage / extraction percentages below which issues are raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Below this: `medium`.
    pub low_pct: f64,
    /// Below this: `high`.
    pub very_low_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_pct: 80.0,
            very_low_pct: 50.0,
        }
    }
}

impl ValidatorConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Reject settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if !(0.0..=100.0).contains(&t.low_pct) || !(0.0..=100.0).contains(&t.very_low_pct) {
            return Err(Error::Config("thresholds must be within 0..=100".to_string()));
        }
        if t.very_low_pct > t.low_pct {
            return Err(Error::Config(format!(
                "very_low_pct ({}) must not exceed low_pct ({})",
                t.very_low_pct, t.low_pct
            )));
        }
        if self.polling.backoff_min_ms == 0 || self.polling.backoff_min_ms > self.polling.backoff_max_ms {
            return Err(Error::Config(
                "backoff_min_ms must be positive and not exceed backoff_max_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.polling.jitter) {
            return Err(Error::Config("jitter must be within 0..=1".to_string()));
        }
        if self.samples_per_run == 0 || self.workers == 0 || self.live_concurrency == 0 {
            return Err(Error::Config(
                "samples_per_run, workers and live_concurrency must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_min_similarity) {
            return Err(Error::Config("fuzzy_min_similarity must be within 0..=1".to_string()));
        }
        Ok(())
    }

    /// Whether live endpoints are configured.
    pub fn live_ready(&self) -> bool {
        !self.ingest.url.is_empty() && !self.query.endpoint.url.is_empty()
    }

    /// Whether a generator id belongs to a high-priority vendor.
    pub fn is_priority(&self, generator_id: &str) -> bool {
        self.priority_vendors.iter().any(|vendor| {
            let vendor = vendor.trim().to_lowercase();
            !vendor.is_empty()
                && (generator_id == vendor
                    || generator_id
                        .strip_prefix(&vendor)
                        .is_some_and(|rest| rest.starts_with('_')))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ValidatorConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ValidatorConfig = serde_json::from_str(
            r#"{"polling": {"deadline_secs": 30}, "query": {"url": "http://q", "max_results": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.polling.deadline_secs, 30);
        assert_eq!(config.polling.backoff_max_ms, 15_000);
        assert_eq!(config.query.endpoint.url, "http://q");
        assert_eq!(config.query.max_results, 50);
        assert_eq!(config.samples_per_run, 3);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = ValidatorConfig::default();
        config.thresholds.very_low_pct = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut config = ValidatorConfig::default();
        config.polling.backoff_min_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn priority_matches_vendor_prefix() {
        let config = ValidatorConfig {
            priority_vendors: vec!["Cisco".to_string()],
            ..ValidatorConfig::default()
        };
        assert!(config.is_priority("cisco_asa"));
        assert!(config.is_priority("cisco"));
        assert!(!config.is_priority("ciscoish_thing"));
        assert!(!config.is_priority("okta"));
    }

    #[test]
    fn tokens_are_not_serialized() {
        let mut config = ValidatorConfig::default();
        config.ingest.token = "secret".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
