use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::model::{CanonicalProduct, Collection};
use crate::store::{self, CatalogDocument};

/// Provenance given to records that reach the store without any.
pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: Vec<CanonicalProduct>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
}

impl MergeOutcome {
    pub fn added_count(&self) -> usize {
        self.added.len()
    }

    pub fn updated_count(&self) -> usize {
        self.updated.len()
    }
}

/// Merge an incoming batch into the existing records, keyed by id.
///
/// Existing order is kept and new ids are appended in arrival order. For a
/// known id every field the incoming record carries overwrites the stored
/// one, except `addedDate` and `verified` which keep their stored values.
/// `sources` becomes the ordered union and `lastUpdated` is set to
/// `run_date` whether or not anything changed.
pub fn merge(
    existing: Vec<CanonicalProduct>,
    incoming: Vec<CanonicalProduct>,
    run_date: NaiveDate,
) -> MergeOutcome {
    let mut merged = existing;
    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.clone(), i))
        .collect();
    let mut added = Vec::new();
    let mut updated = Vec::new();

    for record in incoming {
        match index.get(&record.id) {
            Some(&i) => {
                updated.push(record.id.clone());
                overlay(&mut merged[i], record, run_date);
            }
            None => {
                let record = admit(record, run_date);
                index.insert(record.id.clone(), merged.len());
                added.push(record.id.clone());
                merged.push(record);
            }
        }
    }

    MergeOutcome {
        merged,
        added,
        updated,
    }
}

fn admit(mut record: CanonicalProduct, run_date: NaiveDate) -> CanonicalProduct {
    if record.sources.is_empty() {
        warn!("{} has no sources; recording it as '{}'", record.id, UNKNOWN_SOURCE);
        record.sources.push(UNKNOWN_SOURCE.to_string());
    }
    let added = *record.added_date.get_or_insert(run_date);
    record.last_updated = Some(run_date.max(added));
    record
}

fn overlay(target: &mut CanonicalProduct, incoming: CanonicalProduct, run_date: NaiveDate) {
    let CanonicalProduct {
        id: _,
        slug,
        brand,
        name,
        model,
        kind,
        description,
        details,
        color,
        specifications,
        images,
        purchase_links,
        tags,
        sources,
        added_date,
        last_updated: _,
        verified,
        extra,
    } = incoming;

    fn take<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }

    take(&mut target.slug, slug);
    take(&mut target.brand, brand);
    take(&mut target.name, name);
    take(&mut target.model, model);
    take(&mut target.kind, kind);
    take(&mut target.description, description);
    take(&mut target.details, details);
    take(&mut target.color, color);
    take(&mut target.specifications, specifications);
    take(&mut target.images, images);
    take(&mut target.purchase_links, purchase_links);
    take(&mut target.tags, tags);

    for s in sources {
        if !target.sources.contains(&s) {
            target.sources.push(s);
        }
    }
    if target.added_date.is_none() {
        target.added_date = added_date;
    }
    if target.verified.is_none() {
        target.verified = verified;
    }
    target.extra.extend(extra);

    let floor = target.added_date.unwrap_or(run_date);
    target.last_updated = Some(run_date.max(floor));
}

/// Replace the whole collection with the incoming batch.
pub fn replace(incoming: Vec<CanonicalProduct>, run_date: NaiveDate) -> MergeOutcome {
    let merged: Vec<CanonicalProduct> = incoming.into_iter().map(|r| admit(r, run_date)).collect();
    let added = merged.iter().map(|p| p.id.clone()).collect();
    MergeOutcome {
        merged,
        added,
        updated: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Write the result; otherwise only report.
    pub execute: bool,
    pub backup: bool,
    /// Replace the store contents instead of merging into them.
    pub replace: bool,
    pub backup_dir: PathBuf,
    pub run_date: NaiveDate,
    pub now: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub collection: Collection,
    pub store: String,
    pub dry_run: bool,
    pub mode: String,
    pub existing: usize,
    pub incoming: usize,
    pub added_count: usize,
    pub updated_count: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
}

impl MergeReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} added, {} updated, {} total{}",
            self.collection,
            self.added_count,
            self.updated_count,
            self.total,
            if self.dry_run { " (dry run)" } else { "" }
        )
    }
}

/// Merge `incoming` into the store file at `store_path`.
///
/// With `execute` the prior file is backed up (unless disabled) before the
/// merged document replaces it atomically. A dry run touches no files.
pub fn reconcile(
    store_path: &Path,
    collection: Collection,
    incoming: Vec<CanonicalProduct>,
    opts: &MergeOptions,
) -> Result<MergeReport, StoreError> {
    let mut doc = CatalogDocument::load_or_empty(store_path, collection)?;
    let existing = doc.products.len();
    let incoming_count = incoming.len();

    let outcome = if opts.replace {
        replace(incoming, opts.run_date)
    } else {
        merge(std::mem::take(&mut doc.products), incoming, opts.run_date)
    };

    let mut report = MergeReport {
        collection,
        store: store_path.display().to_string(),
        dry_run: !opts.execute,
        mode: if opts.replace { "replace" } else { "merge" }.to_string(),
        existing,
        incoming: incoming_count,
        added_count: outcome.added_count(),
        updated_count: outcome.updated_count(),
        total: outcome.merged.len(),
        backup: None,
        added: outcome.added,
        updated: outcome.updated,
    };

    if !opts.execute {
        info!("Dry run, {} not written: {}", store_path.display(), report.summary());
        return Ok(report);
    }

    if opts.backup {
        report.backup = store::backup(store_path, &opts.backup_dir, collection, opts.now)?
            .map(|p| p.display().to_string());
    } else {
        warn!("Writing {} without a backup", store_path.display());
    }

    doc.products = outcome.merged;
    doc.save(store_path)?;
    info!("Wrote {}: {}", store_path.display(), report.summary());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn product(v: serde_json::Value) -> CanonicalProduct {
        serde_json::from_value(v).unwrap()
    }

    fn opts(dir: &Path, execute: bool) -> MergeOptions {
        MergeOptions {
            execute,
            backup: true,
            replace: false,
            backup_dir: dir.join("backups"),
            run_date: date("2025-01-15"),
            now: date("2025-01-15").and_hms_opt(10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn sources_union_and_field_overwrite() {
        let existing = vec![product(json!({ "id": "a", "sources": ["x"] }))];
        let incoming = vec![product(json!({ "id": "a", "sources": ["y"], "brand": "Acme" }))];
        let out = merge(existing, incoming, date("2025-01-15"));

        assert_eq!(out.merged.len(), 1);
        let a = &out.merged[0];
        assert_eq!(a.sources, vec!["x", "y"]);
        assert_eq!(a.brand.as_deref(), Some("Acme"));
        assert_eq!(a.last_updated, Some(date("2025-01-15")));
        assert_eq!(out.updated, vec!["a"]);
        assert!(out.added.is_empty());
    }

    #[test]
    fn absent_incoming_fields_do_not_erase() {
        let existing = vec![product(json!({
            "id": "a",
            "sources": ["x"],
            "description": "A long and careful description.",
            "tags": ["piston"],
            "addedDate": "2024-03-01",
            "verified": true
        }))];
        let incoming = vec![product(json!({
            "id": "a",
            "sources": ["y"],
            "name": "Renamed",
            "addedDate": "2025-01-01",
            "verified": false
        }))];
        let a = &merge(existing, incoming, date("2025-01-15")).merged[0];
        assert_eq!(a.description.as_deref(), Some("A long and careful description."));
        assert_eq!(a.tags.as_deref(), Some(&["piston".to_string()][..]));
        assert_eq!(a.name.as_deref(), Some("Renamed"));
        assert_eq!(a.added_date, Some(date("2024-03-01")));
        assert_eq!(a.verified, Some(true));
    }

    #[test]
    fn present_fields_win_even_when_weaker() {
        let existing = vec![product(json!({ "id": "a", "sources": ["x"], "description": "Detailed." }))];
        let incoming = vec![product(json!({ "id": "a", "sources": ["x"], "description": "" }))];
        let a = &merge(existing, incoming, date("2025-01-15")).merged[0];
        assert_eq!(a.description.as_deref(), Some(""));
    }

    #[test]
    fn new_ids_append_in_order() {
        let existing = vec![product(json!({ "id": "b", "sources": ["x"] }))];
        let incoming = vec![
            product(json!({ "id": "c", "sources": ["y"] })),
            product(json!({ "id": "b", "sources": ["y"] })),
            product(json!({ "id": "a" })),
        ];
        let out = merge(existing, incoming, date("2025-01-15"));
        let ids: Vec<&str> = out.merged.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(out.added, vec!["c", "a"]);
        assert_eq!(out.merged[2].sources, vec![UNKNOWN_SOURCE]);
        assert_eq!(out.merged[2].added_date, Some(date("2025-01-15")));
    }

    #[test]
    fn merge_is_idempotent_apart_from_last_updated() {
        let store = vec![
            product(json!({ "id": "a", "sources": ["x"], "brand": "Acme", "addedDate": "2024-01-01" })),
            product(json!({ "id": "b", "sources": ["x"], "addedDate": "2024-01-01" })),
        ];
        let batch = vec![
            product(json!({ "id": "a", "sources": ["y"], "name": "One" })),
            product(json!({ "id": "c", "sources": ["y"], "name": "Three" })),
        ];
        let first = merge(store, batch.clone(), date("2025-01-15")).merged;
        let second = merge(first.clone(), batch, date("2025-02-01")).merged;

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            let mut a = a.clone();
            let b = b.clone();
            if b.id != "b" {
                assert_eq!(b.last_updated, Some(date("2025-02-01")));
            }
            a.last_updated = b.last_updated;
            assert_eq!(a, b);
        }
    }

    #[test]
    fn provenance_never_shrinks() {
        let existing = vec![product(json!({ "id": "a", "sources": ["x", "z"] }))];
        let incoming = vec![product(json!({ "id": "a", "sources": [] }))];
        let a = &merge(existing, incoming, date("2025-01-15")).merged[0];
        assert_eq!(a.sources, vec!["x", "z"]);
    }

    #[test]
    fn reconcile_backs_up_exact_prior_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pens.json");
        let prior = "{\n  \"pens\": [ { \"id\": \"a\", \"sources\": [\"x\"] } ],\n  \"meta\": 1\n}";
        fs::write(&store_path, prior).unwrap();

        let incoming = vec![product(json!({ "id": "b", "sources": ["y"], "name": "B" }))];
        let report = reconcile(&store_path, Collection::Pens, incoming, &opts(dir.path(), true)).unwrap();

        assert_eq!(report.added_count, 1);
        assert_eq!(report.total, 2);
        let backup = PathBuf::from(report.backup.unwrap());
        assert_eq!(fs::read_to_string(backup).unwrap(), prior);

        let written: serde_json::Value = store::read_json(&store_path).unwrap();
        assert_eq!(written["pens"].as_array().unwrap().len(), 2);
        assert_eq!(written["meta"], json!(1));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pens.json");
        let prior = r#"{ "pens": [] }"#;
        fs::write(&store_path, prior).unwrap();

        let incoming = vec![product(json!({ "id": "b", "sources": ["y"] }))];
        let report = reconcile(&store_path, Collection::Pens, incoming, &opts(dir.path(), false)).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.added_count, 1);
        assert_eq!(fs::read_to_string(&store_path).unwrap(), prior);
        assert!(!dir.path().join("backups").exists());
    }

    #[test]
    fn unparsable_store_aborts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pens.json");
        fs::write(&store_path, "{ broken").unwrap();

        let err = reconcile(&store_path, Collection::Pens, vec![], &opts(dir.path(), true)).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
        assert_eq!(fs::read_to_string(&store_path).unwrap(), "{ broken");
    }

    #[test]
    fn replace_mode_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("inks.json");
        fs::write(&store_path, r#"{ "inks": [ { "id": "old", "sources": ["x"] } ] }"#).unwrap();

        let mut o = opts(dir.path(), true);
        o.replace = true;
        let incoming = vec![product(json!({ "id": "new", "sources": ["y"] }))];
        let report = reconcile(&store_path, Collection::Inks, incoming, &o).unwrap();

        assert_eq!(report.mode, "replace");
        assert_eq!(report.total, 1);
        assert!(report.backup.is_some());
        let doc = CatalogDocument::load(&store_path, Collection::Inks).unwrap();
        assert_eq!(doc.products[0].id, "new");
    }
}
