use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::mapper::ProductBatch;
use crate::model::{CanonicalProduct, Collection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    pub errors: Vec<FieldError>,
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema check on the record as it appears in a document. Nothing is coerced.
pub fn validate_value(record: &Value) -> Verdict {
    let mut errors = Vec::new();

    let Value::Object(obj) = record else {
        errors.push(FieldError::new("record", format!("expected object, found {}", kind_of(record))));
        return Verdict { valid: false, errors };
    };

    for field in ["id", "name", "brand"] {
        match obj.get(field) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => errors.push(FieldError::new(field, "must not be empty")),
            None | Some(Value::Null) => errors.push(FieldError::new(field, "is required")),
            Some(other) => errors.push(FieldError::new(
                field,
                format!("expected string, found {}", kind_of(other)),
            )),
        }
    }

    match obj.get("specifications") {
        None | Some(Value::Object(_)) => {}
        Some(other) => errors.push(FieldError::new(
            "specifications",
            format!("expected object, found {}", kind_of(other)),
        )),
    }

    match obj.get("images") {
        None => {}
        Some(Value::Object(images)) => {
            match images.get("main") {
                None | Some(Value::Null) | Some(Value::String(_)) => {}
                Some(other) => errors.push(FieldError::new(
                    "images.main",
                    format!("expected string, found {}", kind_of(other)),
                )),
            }
            match images.get("gallery") {
                None => {}
                Some(Value::Array(items)) => {
                    if let Some(i) = items.iter().position(|v| !v.is_string()) {
                        errors.push(FieldError::new(format!("images.gallery[{i}]"), "expected string"));
                    }
                }
                Some(other) => errors.push(FieldError::new(
                    "images.gallery",
                    format!("expected array, found {}", kind_of(other)),
                )),
            }
        }
        Some(other) => errors.push(FieldError::new(
            "images",
            format!("expected object, found {}", kind_of(other)),
        )),
    }

    match obj.get("purchaseLinks") {
        None => {}
        Some(Value::Array(links)) => {
            for (i, link) in links.iter().enumerate() {
                match link {
                    Value::Object(l) => match l.get("url") {
                        Some(Value::String(_)) => {}
                        None => errors.push(FieldError::new(format!("purchaseLinks[{i}].url"), "is required")),
                        Some(other) => errors.push(FieldError::new(
                            format!("purchaseLinks[{i}].url"),
                            format!("expected string, found {}", kind_of(other)),
                        )),
                    },
                    other => errors.push(FieldError::new(
                        format!("purchaseLinks[{i}]"),
                        format!("expected object, found {}", kind_of(other)),
                    )),
                }
            }
        }
        Some(other) => errors.push(FieldError::new(
            "purchaseLinks",
            format!("expected array, found {}", kind_of(other)),
        )),
    }

    for field in ["tags", "sources"] {
        match obj.get(field) {
            None | Some(Value::Array(_)) => {}
            Some(other) => errors.push(FieldError::new(
                field,
                format!("expected array, found {}", kind_of(other)),
            )),
        }
    }

    Verdict {
        valid: errors.is_empty(),
        errors,
    }
}

pub fn validate(product: &CanonicalProduct) -> Verdict {
    match serde_json::to_value(product) {
        Ok(v) => validate_value(&v),
        Err(e) => Verdict {
            valid: false,
            errors: vec![FieldError::new("record", e.to_string())],
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejected {
    pub collection: Collection,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub errors: Vec<FieldError>,
}

/// Split raw records into accepted products and rejections with reasons.
pub fn partition(
    records: Vec<Value>,
    collection: Collection,
) -> (Vec<CanonicalProduct>, Vec<Rejected>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        let id = record.get("id").and_then(Value::as_str).map(str::to_string);
        let verdict = validate_value(&record);
        if !verdict.valid {
            rejected.push(Rejected {
                collection,
                index,
                id,
                errors: verdict.errors,
            });
            continue;
        }
        match serde_json::from_value::<CanonicalProduct>(record) {
            Ok(p) => accepted.push(p),
            Err(e) => rejected.push(Rejected {
                collection,
                index,
                id,
                errors: vec![FieldError::new("record", e.to_string())],
            }),
        }
    }

    for r in &rejected {
        warn!(
            "Rejected {} #{} ({}): {}",
            collection,
            r.index,
            r.id.as_deref().unwrap_or("no id"),
            r.errors
                .iter()
                .map(|e| format!("{} {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("; ")
        );
    }
    (accepted, rejected)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub accepted_pens: usize,
    pub accepted_inks: usize,
    pub rejected: Vec<Rejected>,
}

/// Validate a `{ pens: [...], inks: [...] }` document.
pub fn validate_document(doc: &Value) -> (ProductBatch, ValidationReport) {
    let mut batch = ProductBatch::default();
    let mut report = ValidationReport::default();

    for collection in Collection::ALL {
        let records = match doc.get(collection.key()) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let (accepted, rejected) = partition(records, collection);
        match collection {
            Collection::Pens => report.accepted_pens = accepted.len(),
            Collection::Inks => report.accepted_inks = accepted.len(),
        }
        *batch.collection_mut(collection) = accepted;
        report.rejected.extend(rejected);
    }
    if let Some(review) = doc.get("needsReview") {
        batch.needs_review = serde_json::from_value(review.clone()).unwrap_or_default();
    }

    info!(
        "Validated: {} pens, {} inks accepted; {} rejected",
        report.accepted_pens,
        report.accepted_inks,
        report.rejected.len()
    );
    (batch, report)
}
