use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FetchFailure;
use crate::error::FetchError;
use crate::model::RawRecord;

/// A JSON search endpoint queried once per configured query string.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub endpoint: String,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default)]
    pub queries: Vec<String>,
    /// Fixed query parameters sent with every request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON pointer to the result array; empty means the document root.
    #[serde(default)]
    pub results_pointer: String,
    /// Target field → item key (or JSON pointer when it starts with `/`).
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    /// Builds the record URL from item fields, e.g. `https://www.wikidata.org/wiki/{id}`.
    #[serde(default)]
    pub url_template: Option<String>,
    /// Routed collection hint copied onto every record (`pen`, `ink`).
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_query_param() -> String {
    "search".to_string()
}

fn default_delay_ms() -> u64 {
    1_000
}

/// Run every query of an API source. Failed queries are recorded and skipped.
pub async fn fetch_api(
    client: &reqwest::Client,
    source_id: &str,
    api: &ApiConfig,
    cancel: &CancellationToken,
    fetched_at: DateTime<Utc>,
) -> (Vec<RawRecord>, Vec<FetchFailure>) {
    let queries: Vec<Option<&str>> = if api.queries.is_empty() {
        vec![None]
    } else {
        api.queries.iter().map(|q| Some(q.as_str())).collect()
    };

    let mut records = Vec::new();
    let mut failures = Vec::new();

    for (i, query) in queries.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("{}: cancelled, {} API queries not issued", source_id, queries.len() - i);
            break;
        }
        if i > 0 && api.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(api.delay_ms)).await;
        }

        let label = query.unwrap_or("(no query)");
        match run_query(client, api, *query).await {
            Ok(items) => {
                debug!("{}: query {:?} returned {} items", source_id, label, items.len());
                records.extend(
                    items
                        .iter()
                        .filter_map(|item| map_item(source_id, api, item, fetched_at)),
                );
            }
            Err(e) => {
                warn!("{}: API query {:?} failed: {}", source_id, label, e);
                failures.push(FetchFailure::new(source_id, &api.endpoint, &e));
            }
        }
    }

    info!("{}: {} records from API", source_id, records.len());
    (records, failures)
}

async fn run_query(
    client: &reqwest::Client,
    api: &ApiConfig,
    query: Option<&str>,
) -> Result<Vec<Value>, FetchError> {
    let mut request = client.get(&api.endpoint).query(&api.params);
    if let Some(q) = query {
        request = request.query(&[(api.query_param.as_str(), q)]);
    }
    let response = request.send().await.map_err(|e| FetchError::from_reqwest(&e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    let body: Value = response.json().await.map_err(|e| FetchError::from_reqwest(&e))?;

    match body.pointer(&api.results_pointer) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(FetchError::Parse(format!(
            "'{}' is not an array",
            api.results_pointer
        ))),
        None => Err(FetchError::Parse(format!(
            "no results at '{}'",
            api.results_pointer
        ))),
    }
}

fn lookup<'a>(item: &'a Value, key: &str) -> Option<&'a Value> {
    if key.starts_with('/') {
        item.pointer(key)
    } else {
        item.get(key)
    }
}

fn fill_template(template: &str, item: &Value) -> Option<String> {
    let mut out = template.to_string();
    let Value::Object(fields) = item else {
        return None;
    };
    for (key, value) in fields {
        let placeholder = format!("{{{key}}}");
        if !out.contains(&placeholder) {
            continue;
        }
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        out = out.replace(&placeholder, &text);
    }
    if out.contains('{') {
        None
    } else {
        Some(out)
    }
}

/// One API result item as a raw record. Items that yield no fields are dropped.
pub fn map_item(
    source_id: &str,
    api: &ApiConfig,
    item: &Value,
    fetched_at: DateTime<Utc>,
) -> Option<RawRecord> {
    let mut fields: BTreeMap<String, Value> = if api.field_mapping.is_empty() {
        item.as_object()?
            .iter()
            .filter(|(_, v)| !v.is_null() && !v.is_object())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        api.field_mapping
            .iter()
            .filter_map(|(target, key)| {
                lookup(item, key)
                    .filter(|v| !v.is_null())
                    .map(|v| (target.clone(), v.clone()))
            })
            .collect()
    };
    if fields.is_empty() {
        return None;
    }

    let url = api
        .url_template
        .as_deref()
        .and_then(|t| fill_template(t, item))
        .or_else(|| match fields.remove("url") {
            Some(Value::String(u)) => Some(u),
            _ => None,
        });
    if let Some(kind) = &api.kind {
        fields
            .entry("kind".to_string())
            .or_insert_with(|| Value::String(kind.clone()));
    }
    fields.remove("url");

    let mut record = RawRecord::new(source_id, url, fetched_at);
    record.fields = fields;
    Some(record)
}
