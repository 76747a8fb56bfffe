//! Ingestion and query endpoint contracts.
//!
//! The live validator only talks to these traits. HTTP implementations are
//! provided behind the `http` feature; tests use in-process fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::SampleEvent;

/// Submits tagged events. One call is one batch.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Ship `events` for the parser named `sourcetype`. Success means the
    /// whole batch was accepted.
    async fn submit(&self, sourcetype: &str, events: &[SampleEvent], tag_field: &str) -> Result<()>;
}

/// Retrieves parsed events.
#[async_trait]
pub trait EventQuery: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<Vec<RetrievedEvent>>;
}

/// A tag search over a time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRequest {
    /// Filter expression; matches events containing the quoted tag.
    pub filter: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub max_count: usize,
}

impl QueryRequest {
    /// Filter for events containing any of `tags`.
    pub fn for_tags<S: AsRef<str>>(tags: &[S], start_ms: i64, end_ms: i64, max_count: usize) -> Self {
        let filter = tags
            .iter()
            .map(|t| format!("\"{}\"", t.as_ref().replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(" OR ");
        Self {
            filter,
            start_ms,
            end_ms,
            max_count,
        }
    }
}

/// One event as returned by the query endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedEvent {
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub message: String,
    /// Fields the parser extracted.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RetrievedEvent {
    /// Whether the tag appears in the message or any attribute value.
    pub fn contains_tag(&self, tag: &str) -> bool {
        !tag.is_empty()
            && (self.message.contains(tag) || self.attributes.values().any(|v| value_contains(v, tag)))
    }

    /// Extracted attributes flattened to lower-cased dotted paths.
    pub fn flat_attributes(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.attributes {
            flatten(&key.to_lowercase(), value, &mut out);
        }
        out
    }

    /// Whether `field` was extracted with a non-empty value.
    pub fn has_field(&self, flat: &BTreeMap<String, Value>, field: &str) -> bool {
        let field = field.to_lowercase();
        let populated = |v: &Value| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => true,
        };
        if flat.get(&field).is_some_and(populated) {
            return true;
        }
        // A declared object field such as `actor` counts when any child is set.
        let prefix = format!("{field}.");
        flat.iter().any(|(k, v)| k.starts_with(&prefix) && populated(v))
    }

    /// Event time in epoch milliseconds, when it can be read.
    ///
    /// Accepts seconds, milliseconds, or nanoseconds (as number or numeric
    /// string) and RFC 3339 strings.
    pub fn timestamp_ms(&self) -> Option<i64> {
        let (int, float) = match self.timestamp.as_ref()? {
            Value::Number(n) => (n.as_i64(), n.as_f64()),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    (Some(i), None)
                } else if let Ok(f) = s.parse::<f64>() {
                    (None, Some(f))
                } else {
                    return chrono::DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.timestamp_millis());
                }
            }
            _ => return None,
        };
        if let Some(i) = int {
            return if i >= 1_000_000_000_000_000 {
                Some(i / 1_000_000)
            } else if i >= 100_000_000_000 {
                Some(i)
            } else {
                i.checked_mul(1_000)
            };
        }
        let f = float.filter(|f| f.is_finite())?;
        let ms = if f >= 1e15 {
            f / 1e6
        } else if f >= 1e11 {
            f
        } else {
            f * 1e3
        };
        Some(ms as i64)
    }
}

fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.contains(needle),
        Value::Array(items) => items.iter().any(|v| value_contains(v, needle)),
        Value::Object(map) => map.values().any(|v| value_contains(v, needle)),
        _ => false,
    }
}

fn flatten(path: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                flatten(&format!("{path}.{}", key.to_lowercase()), child, out);
            }
        }
        other => {
            out.insert(path.to_string(), other.clone());
        }
    }
}

/// Envelope for one event on the ingestion endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IngestEnvelope<'a> {
    pub event: Value,
    pub sourcetype: &'a str,
    pub fields: BTreeMap<&'a str, &'a str>,
}

impl<'a> IngestEnvelope<'a> {
    pub fn new(sourcetype: &'a str, sample: &'a SampleEvent, tag_field: &'a str) -> Self {
        let event = match &sample.structured {
            Some(tree) => tree.clone(),
            None => Value::String(sample.raw_text.clone()),
        };
        Self {
            event,
            sourcetype,
            fields: BTreeMap::from([(tag_field, sample.tag.as_str())]),
        }
    }
}

#[cfg(feature = "http")]
pub use self::http::{HttpIngest, HttpQuery};

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde::Deserialize;

    use super::{EventQuery, IngestEnvelope, IngestSink, QueryRequest, RetrievedEvent};
    use crate::error::{Error, Result};
    use crate::model::SampleEvent;

    fn build_client(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("building client: {e}")))
    }

    /// Collector-style ingestion endpoint.
    #[derive(Debug, Clone)]
    pub struct HttpIngest {
        client: reqwest::Client,
        url: String,
        token: String,
    }

    impl HttpIngest {
        pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: build_client(timeout)?,
                url: format!("{}/services/collector/event", base_url.trim_end_matches('/')),
                token: token.to_string(),
            })
        }
    }

    #[async_trait]
    impl IngestSink for HttpIngest {
        async fn submit(&self, sourcetype: &str, events: &[SampleEvent], tag_field: &str) -> Result<()> {
            let mut body = String::new();
            for sample in events {
                let envelope = IngestEnvelope::new(sourcetype, sample, tag_field);
                body.push_str(&serde_json::to_string(&envelope)?);
                body.push('\n');
            }

            let response = self
                .client
                .post(&self.url)
                .header("Authorization", format!("Splunk {}", self.token))
                .header("Content-Type", "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| Error::Submission(format!("POST {}: {e}", self.url)))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                return Err(Error::Submission(format!(
                    "POST {} returned {status}: {}",
                    self.url,
                    text.trim()
                )));
            }
            Ok(())
        }
    }

    /// Log query endpoint.
    #[derive(Debug, Clone)]
    pub struct HttpQuery {
        client: reqwest::Client,
        url: String,
        token: String,
    }

    impl HttpQuery {
        pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: build_client(timeout)?,
                url: format!("{}/api/query", base_url.trim_end_matches('/')),
                token: token.to_string(),
            })
        }
    }

    #[derive(Debug, Deserialize)]
    struct QueryResponse {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        matches: Vec<RetrievedEvent>,
    }

    /// Map an HTTP status to the retry taxonomy.
    pub(super) fn status_error(status: StatusCode, body: &str) -> Error {
        let reason = format!("{status}: {}", body.trim());
        if status == StatusCode::TOO_MANY_REQUESTS {
            Error::TransientQuery {
                reason,
                rate_limited: true,
            }
        } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
            Error::TransientQuery {
                reason,
                rate_limited: false,
            }
        } else {
            Error::FatalQuery(reason)
        }
    }

    #[async_trait]
    impl EventQuery for HttpQuery {
        async fn query(&self, request: &QueryRequest) -> Result<Vec<RetrievedEvent>> {
            let payload = serde_json::json!({
                "queryType": "log",
                "filter": request.filter,
                "startTime": request.start_ms,
                "endTime": request.end_ms,
                "maxCount": request.max_count,
            });

            let response = self
                .client
                .post(&self.url)
                .bearer_auth(&self.token)
                .json(&payload)
                .send()
                .await
                .map_err(|e| Error::TransientQuery {
                    reason: format!("POST {}: {e}", self.url),
                    rate_limited: false,
                })?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(status_error(status, &text));
            }

            let body: QueryResponse = response
                .json()
                .await
                .map_err(|e| Error::FatalQuery(format!("unreadable query response: {e}")))?;
            if body.status != "success" {
                return Err(Error::FatalQuery(
                    body.message.unwrap_or_else(|| format!("query status '{}'", body.status)),
                ));
            }
            Ok(body.matches)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn status_taxonomy() {
            assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_rate_limited());
            assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
            assert!(status_error(StatusCode::REQUEST_TIMEOUT, "").is_transient());
            assert!(!status_error(StatusCode::UNAUTHORIZED, "").is_transient());
            assert!(!status_error(StatusCode::BAD_REQUEST, "bad filter").is_transient());
        }
    }
}
