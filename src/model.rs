use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The two store documents the storefront reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Pens,
    Inks,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Pens, Collection::Inks];

    /// Top-level key of the store document (`{ "pens": [...] }`).
    pub fn key(self) -> &'static str {
        match self {
            Collection::Pens => "pens",
            Collection::Inks => "inks",
        }
    }

    pub fn default_type(self) -> &'static str {
        match self {
            Collection::Pens => "Fountain Pen",
            Collection::Inks => "Dye-based",
        }
    }

    pub fn id_prefix(self) -> &'static str {
        match self {
            Collection::Pens => "pen",
            Collection::Inks => "ink",
        }
    }

    /// Guess the collection from a store file name (`inks.json`, `pens-2024.json`).
    pub fn infer_from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?.to_lowercase();
        if stem.contains("ink") {
            Some(Collection::Inks)
        } else if stem.contains("pen") {
            Some(Collection::Pens)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Specification values are kept to a closed set so merge and scoring stay total.
/// Numbers keep their JSON form, so `17` is written back as `17`, not `17.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpecValue {
    Number(serde_json::Number),
    Text(String),
    List(Vec<String>),
}

pub type Specifications = BTreeMap<String, SpecValue>;

impl SpecValue {
    /// Flatten an arbitrary JSON value into `(key, SpecValue)` pairs.
    /// Nested objects become dotted keys, booleans become "yes"/"no",
    /// nulls and empty values are dropped.
    pub fn flatten_json(key: &str, value: &Value) -> Vec<(String, SpecValue)> {
        match value {
            Value::Null => Vec::new(),
            Value::Bool(b) => vec![(key.to_string(), SpecValue::Text(if *b { "yes" } else { "no" }.into()))],
            Value::Number(n) => vec![(key.to_string(), SpecValue::Number(n.clone()))],
            Value::String(s) if s.trim().is_empty() => Vec::new(),
            Value::String(s) => vec![(key.to_string(), SpecValue::Text(s.clone()))],
            Value::Array(items) => {
                let list: Vec<String> = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect();
                if list.is_empty() {
                    Vec::new()
                } else {
                    vec![(key.to_string(), SpecValue::List(list))]
                }
            }
            Value::Object(map) => map
                .iter()
                .flat_map(|(k, v)| SpecValue::flatten_json(&format!("{key}.{k}"), v))
                .collect(),
        }
    }

    /// A parsed measurement; whole values are stored as integers.
    pub fn from_f64(f: f64) -> Option<Self> {
        if f.fract() == 0.0 && f.abs() < 1e15 {
            Some(SpecValue::Number((f as i64).into()))
        } else {
            serde_json::Number::from_f64(f).map(SpecValue::Number)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SpecValue::Number(_) => false,
            SpecValue::Text(s) => s.trim().is_empty(),
            SpecValue::List(l) => l.is_empty(),
        }
    }
}

/// Build a typed specification map from a JSON object.
pub fn specifications_from_json(map: &serde_json::Map<String, Value>) -> Specifications {
    map.iter()
        .flat_map(|(k, v)| SpecValue::flatten_json(k, v))
        .collect()
}

fn deserialize_specifications<'de, D>(deserializer: D) -> Result<Option<Specifications>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(specifications_from_json(&map))),
        Some(_) => Err(serde::de::Error::custom("specifications must be an object")),
    }
}

/// Accepts either a list of strings or a single comma separated string.
fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(
            s.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!(
                    "expected a string list entry, found {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a list of strings, found {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Images {
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub gallery: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLabel {
    Timeout,
    Placeholder,
    Invalid,
}

/// Verdict status: the HTTP code when the server answered, a label otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkStatus {
    Code(u16),
    Label(StatusLabel),
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Code(c) => write!(f, "{c}"),
            LinkStatus::Label(StatusLabel::Timeout) => f.write_str("timeout"),
            LinkStatus::Label(StatusLabel::Placeholder) => f.write_str("placeholder"),
            LinkStatus::Label(StatusLabel::Invalid) => f.write_str("invalid"),
        }
    }
}

/// Result of checking one external URL. Attached to links transiently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub status: LinkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn ok(code: u16) -> Self {
        Self {
            valid: true,
            status: LinkStatus::Code(code),
            error: None,
        }
    }

    pub fn failed(status: LinkStatus, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            status,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseLink {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LinkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated: Option<NaiveDate>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A reconciled product record. Every descriptive field is optional so that
/// "absent" and "present" stay distinguishable through merge: only fields an
/// incoming record actually carries may overwrite stored ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalProduct {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_specifications"
    )]
    pub specifications: Option<Specifications>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Images>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_links: Option<Vec<PurchaseLink>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_string_list"
    )]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_sources")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    /// Storefront fields this pipeline does not model; carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn deserialize_sources<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_string_list(deserializer)?.unwrap_or_default())
}

impl CanonicalProduct {
    pub fn display_name(&self) -> String {
        match (&self.brand, &self.name) {
            (Some(b), Some(n)) => format!("{b} {n}"),
            (None, Some(n)) => n.clone(),
            (Some(b), None) => b.clone(),
            (None, None) => self.id.clone(),
        }
    }

    pub fn links(&self) -> &[PurchaseLink] {
        self.purchase_links.as_deref().unwrap_or(&[])
    }

    pub fn has_price(&self) -> bool {
        self.links().iter().any(|l| l.price.is_some())
    }
}

/// One scraped page or API item before mapping. Schema-free apart from the
/// provenance fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl RawRecord {
    pub fn new(source_id: impl Into<String>, url: Option<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            fetched_at,
            url,
            fields: BTreeMap::new(),
        }
    }

    /// Non-empty string value of a field; numbers are stringified.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
