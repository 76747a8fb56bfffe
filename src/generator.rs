//! Generator registration contract and the on-disk template generator.
//!
//! A generator exposes exactly one capability: produce one event, optionally
//! forcing specific field values. Generators are either registered in code
//! (any `Fn(&Overrides) -> Result<GeneratedEvent>` qualifies) or loaded from
//! a JSON template:
//!
//! ```json
//! {
//!   "vendor": "acme",
//!   "product": "widget",
//!   "format": "kv",
//!   "fields": { "ts": "{{now}}", "user": "{{pick:alice|bob}}", "src": { "ip": "{{ipv4}}" } }
//! }
//! ```
//!
//! String values may contain the placeholders `{{now}}`, `{{epoch_ms}}`,
//! `{{uuid}}`, `{{ipv4}}`, `{{int:A-B}}` and `{{pick:a|b|c}}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Field values to force, keyed by dotted path.
pub type Overrides = BTreeMap<String, Value>;

/// The single capability every generator exposes.
pub trait EventGenerator: Send + Sync {
    /// Produce one event. Must not require any argument beyond overrides.
    fn generate(&self, overrides: &Overrides) -> Result<GeneratedEvent>;
}

impl<F> EventGenerator for F
where
    F: Fn(&Overrides) -> Result<GeneratedEvent> + Send + Sync,
{
    fn generate(&self, overrides: &Overrides) -> Result<GeneratedEvent> {
        self(overrides)
    }
}

/// Raw generator output before tagging.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedEvent {
    /// Field tree. An object for structured events; may be empty for
    /// free-text generators.
    pub tree: Value,
    pub raw_text: String,
    /// Whether the event ships as a structured document.
    pub structured: bool,
}

impl GeneratedEvent {
    pub fn structured(tree: Value) -> Self {
        let raw_text = tree.to_string();
        Self {
            tree,
            raw_text,
            structured: true,
        }
    }

    pub fn text(raw_text: impl Into<String>, tree: Value) -> Self {
        Self {
            tree,
            raw_text: raw_text.into(),
            structured: false,
        }
    }

    /// Dotted leaf paths of the field tree. Free-text events without a tree
    /// fall back to the `key=value` tokens found in the text.
    pub fn flat_fields(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        flatten_into("", &self.tree, &mut out);
        if out.is_empty() && !self.structured {
            for caps in KV_TOKEN.captures_iter(&self.raw_text) {
                let value = caps[2].trim_matches('"').to_string();
                out.insert(caps[1].to_string(), Value::String(value));
            }
        }
        out
    }
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(?::([^}]*))?\}\}").expect("valid regex")
});

pub(crate) static KV_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_.]*)=("[^"]*"|[^\s,]+)"#).expect("valid regex")
});

fn flatten_into(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&path, child, out);
            }
        }
        _ if prefix.is_empty() => {}
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}

/// Render mode of a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFormat {
    #[default]
    Json,
    Syslog,
    #[serde(alias = "key_value", alias = "keyvalue")]
    Kv,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateDoc {
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    format: TemplateFormat,
    #[serde(default)]
    fields: Map<String, Value>,
    /// Column order for CSV output; defaults to sorted field paths.
    #[serde(default)]
    columns: Vec<String>,
    /// Line template for syslog/text output; `{{path}}` pulls a field value.
    #[serde(default)]
    template: Option<String>,
}

/// A generator backed by a JSON template document on disk.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    path: PathBuf,
    doc: TemplateDoc,
}

impl TemplateGenerator {
    /// Load and validate a template document.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let doc: TemplateDoc = serde_json::from_str(content).map_err(|e| Error::Discovery {
            path: path.to_path_buf(),
            reason: format!("invalid template: {e}"),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    /// `vendor_product` slug when both are declared.
    pub fn product_slug(&self) -> Option<String> {
        match (&self.doc.vendor, &self.doc.product) {
            (Some(v), Some(p)) => Some(format!("{v}_{p}")),
            _ => None,
        }
    }

    pub fn format(&self) -> TemplateFormat {
        self.doc.format
    }

    fn fail(&self, reason: String) -> Error {
        Error::Discovery {
            path: self.path.clone(),
            reason,
        }
    }

    fn resolve_tree(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => self.expand(s)?,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_tree(v))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_tree(v)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    /// Expand placeholders. A string that is exactly one `{{int:..}}`
    /// placeholder becomes a number.
    fn expand(&self, s: &str) -> Result<Value> {
        if let Some(caps) = PLACEHOLDER.captures(s) {
            if caps.get(0).is_some_and(|m| m.as_str() == s) && &caps[1] == "int" {
                let n = self.random_int(caps.get(2).map_or("", |m| m.as_str()))?;
                return Ok(Value::from(n));
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(s) {
            let whole = caps.get(0).expect("group 0 always present");
            out.push_str(&s[last..whole.start()]);
            let arg = caps.get(2).map_or("", |m| m.as_str());
            out.push_str(&self.placeholder(&caps[1], arg)?);
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    fn placeholder(&self, name: &str, arg: &str) -> Result<String> {
        let mut rng = rand::thread_rng();
        Ok(match name {
            "now" => chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "epoch_ms" => chrono::Utc::now().timestamp_millis().to_string(),
            "uuid" => uuid::Uuid::new_v4().to_string(),
            "ipv4" => format!(
                "10.{}.{}.{}",
                rng.gen_range(0..=255),
                rng.gen_range(0..=255),
                rng.gen_range(1..=254)
            ),
            "int" => self.random_int(arg)?.to_string(),
            "pick" => {
                let options: Vec<&str> = arg.split('|').map(str::trim).collect();
                options
                    .choose(&mut rng)
                    .filter(|o| !o.is_empty())
                    .ok_or_else(|| self.fail("{{pick}} needs at least one option".to_string()))?
                    .to_string()
            }
            other => return Err(self.fail(format!("unknown placeholder '{{{{{other}}}}}'"))),
        })
    }

    fn random_int(&self, arg: &str) -> Result<i64> {
        let (lo, hi) = arg
            .split_once('-')
            .and_then(|(a, b)| Some((a.trim().parse::<i64>().ok()?, b.trim().parse::<i64>().ok()?)))
            .ok_or_else(|| self.fail(format!("{{{{int:{arg}}}}} is not a range like 1-100")))?;
        if lo > hi {
            return Err(self.fail(format!("{{{{int:{arg}}}}} has an empty range")));
        }
        Ok(rand::thread_rng().gen_range(lo..=hi))
    }

    fn render(&self, tree: &Value) -> Result<GeneratedEvent> {
        let event = GeneratedEvent::text(String::new(), tree.clone());
        let flat = event.flat_fields();
        let raw_text = match self.doc.format {
            TemplateFormat::Json => return Ok(GeneratedEvent::structured(tree.clone())),
            TemplateFormat::Kv => render_kv(&flat),
            TemplateFormat::Csv => {
                let columns: Vec<&String> = if self.doc.columns.is_empty() {
                    flat.keys().collect()
                } else {
                    self.doc.columns.iter().collect()
                };
                columns
                    .iter()
                    .map(|c| csv_cell(flat.get(c.as_str())))
                    .collect::<Vec<_>>()
                    .join(",")
            }
            TemplateFormat::Syslog => match &self.doc.template {
                Some(template) => self.render_line(template, &flat)?,
                None => {
                    let product = self.doc.product.as_deref().unwrap_or("app");
                    let ts = chrono::Utc::now().format("%b %e %H:%M:%S");
                    format!("<134>{ts} host {product}: {}", render_kv(&flat))
                }
            },
        };
        Ok(GeneratedEvent::text(raw_text, tree.clone()))
    }

    fn render_line(&self, template: &str, flat: &BTreeMap<String, Value>) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let whole = caps.get(0).expect("group 0 always present");
            out.push_str(&template[last..whole.start()]);
            match flat.get(&caps[1]) {
                Some(v) => out.push_str(&plain(v)),
                None => {
                    let arg = caps.get(2).map_or("", |m| m.as_str());
                    out.push_str(&self.placeholder(&caps[1], arg)?);
                }
            }
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}

impl EventGenerator for TemplateGenerator {
    fn generate(&self, overrides: &Overrides) -> Result<GeneratedEvent> {
        let mut tree = self.resolve_tree(&Value::Object(self.doc.fields.clone()))?;
        for (path, value) in overrides {
            set_path(&mut tree, path, value.clone());
        }
        self.render(&tree)
    }
}

fn set_path(tree: &mut Value, path: &str, value: Value) {
    let mut node = tree;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_kv(flat: &BTreeMap<String, Value>) -> String {
    flat.iter()
        .map(|(k, v)| {
            let s = plain(v);
            if s.contains(char::is_whitespace) || s.is_empty() {
                format!("{k}=\"{s}\"")
            } else {
                format!("{k}={s}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn csv_cell(v: Option<&Value>) -> String {
    let s = v.map(plain).unwrap_or_default();
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(doc: &str) -> TemplateGenerator {
        TemplateGenerator::parse(Path::new("test.json"), doc).unwrap()
    }

    #[test]
    fn json_template_produces_structured_event() {
        let generator = template(r#"{"fields": {"user": "alice", "src": {"ip": "{{ipv4}}"}}}"#);
        let event = generator.generate(&Overrides::new()).unwrap();
        assert!(event.structured);
        let flat = event.flat_fields();
        assert_eq!(flat["user"], json!("alice"));
        assert!(flat["src.ip"].as_str().unwrap().starts_with("10."));
    }

    #[test]
    fn int_placeholder_becomes_number() {
        let generator = template(r#"{"fields": {"port": "{{int:1-1}}"}}"#);
        let event = generator.generate(&Overrides::new()).unwrap();
        assert_eq!(event.tree["port"], json!(1));
    }

    #[test]
    fn overrides_replace_nested_values() {
        let generator = template(r#"{"fields": {"actor": {"user": "{{pick:a|b}}"}}}"#);
        let overrides = Overrides::from([("actor.user".to_string(), json!("forced"))]);
        let event = generator.generate(&overrides).unwrap();
        assert_eq!(event.tree["actor"]["user"], json!("forced"));
    }

    #[test]
    fn kv_template_renders_pairs() {
        let generator = template(r#"{"format": "kv", "fields": {"action": "allow", "msg": "two words"}}"#);
        let event = generator.generate(&Overrides::new()).unwrap();
        assert!(!event.structured);
        assert_eq!(event.raw_text, r#"action=allow msg="two words""#);
    }

    #[test]
    fn csv_template_follows_column_order() {
        let generator = template(
            r#"{"format": "csv", "columns": ["b", "a", "c"], "fields": {"a": "1", "b": "2", "c": "x,y"}}"#,
        );
        let event = generator.generate(&Overrides::new()).unwrap();
        assert_eq!(event.raw_text, "2,1,\"x,y\"");
    }

    #[test]
    fn syslog_template_substitutes_fields() {
        let generator = template(
            r#"{"format": "syslog", "template": "<14>{{user}} did {{action}}", "fields": {"user": "bob", "action": "login"}}"#,
        );
        let event = generator.generate(&Overrides::new()).unwrap();
        assert_eq!(event.raw_text, "<14>bob did login");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let generator = template(r#"{"fields": {"x": "{{bogus}}"}}"#);
        assert!(generator.generate(&Overrides::new()).is_err());
    }

    #[test]
    fn bad_int_range_is_an_error() {
        let generator = template(r#"{"fields": {"x": "{{int:9-1}}"}}"#);
        assert!(generator.generate(&Overrides::new()).is_err());
    }

    #[test]
    fn free_text_falls_back_to_kv_tokens() {
        let event = GeneratedEvent::text("<13>host app: user=alice action=\"log in\"", Value::Null);
        let flat = event.flat_fields();
        assert_eq!(flat["user"], json!("alice"));
        assert_eq!(flat["action"], json!("log in"));
    }

    #[test]
    fn closures_are_generators() {
        let generator =
            |_: &Overrides| -> Result<GeneratedEvent> { Ok(GeneratedEvent::structured(json!({"a": 1}))) };
        let event = EventGenerator::generate(&generator, &Overrides::new()).unwrap();
        assert_eq!(event.flat_fields().len(), 1);
    }
}
