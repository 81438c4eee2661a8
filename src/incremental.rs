use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::merge::{self, MergeOptions, MergeReport};
use crate::model::{CanonicalProduct, Collection};
use crate::store::{self, CatalogDocument};

/// Incoming records split against the store by timestamp.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub new_items: Vec<CanonicalProduct>,
    pub updated_items: Vec<CanonicalProduct>,
    /// Known ids whose incoming timestamp is not strictly newer.
    pub stale: Vec<String>,
}

fn stamp(p: &CanonicalProduct) -> Option<NaiveDate> {
    p.last_updated.or(p.added_date)
}

/// An incoming record for a known id is kept only when its
/// `lastUpdated`/`addedDate` is strictly newer than the stored one.
pub fn plan(existing: &[CanonicalProduct], incoming: Vec<CanonicalProduct>) -> UpdatePlan {
    let by_id: HashMap<&str, &CanonicalProduct> =
        existing.iter().map(|p| (p.id.as_str(), p)).collect();
    let mut out = UpdatePlan::default();

    for record in incoming {
        match by_id.get(record.id.as_str()) {
            None => out.new_items.push(record),
            Some(current) => {
                let newer = match (stamp(&record), stamp(current)) {
                    (Some(a), Some(b)) => a > b,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if newer {
                    out.updated_items.push(record);
                } else {
                    out.stale.push(record.id);
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub collection: Collection,
    pub ran_at: NaiveDateTime,
    pub dry_run: bool,
    pub new_items: usize,
    pub updated_items: usize,
    pub stale_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeReport>,
    /// Counts from the previous report at the same path, if there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PreviousRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousRun {
    pub ran_at: NaiveDateTime,
    pub new_items: usize,
    pub updated_items: usize,
}

/// Plan against the store at `store_path` and, unless dry-running, hand the
/// filtered subset to the merger. The report is written to `report_path`
/// after the previous one there has been read for comparison.
pub fn run(
    store_path: &Path,
    collection: Collection,
    incoming: Vec<CanonicalProduct>,
    opts: &MergeOptions,
    report_path: Option<&Path>,
) -> Result<UpdateReport, StoreError> {
    let doc = CatalogDocument::load_or_empty(store_path, collection)?;
    let plan = plan(&doc.products, incoming);
    info!(
        "{}: {} new, {} newer, {} not newer",
        collection,
        plan.new_items.len(),
        plan.updated_items.len(),
        plan.stale.len()
    );

    let previous = report_path.and_then(|p| previous_run(p, collection));

    let mut report = UpdateReport {
        collection,
        ran_at: opts.now,
        dry_run: !opts.execute,
        new_items: plan.new_items.len(),
        updated_items: plan.updated_items.len(),
        stale_items: plan.stale.len(),
        merge: None,
        previous,
    };

    if opts.execute && (report.new_items > 0 || report.updated_items > 0) {
        let mut subset = plan.new_items;
        subset.extend(plan.updated_items);
        report.merge = Some(merge::reconcile(store_path, collection, subset, opts)?);
    } else if opts.execute {
        info!("{}: nothing newer than the store, not writing", collection);
    }

    if let Some(path) = report_path {
        store::write_json_atomic(path, &report)?;
    }
    Ok(report)
}

fn previous_run(path: &Path, collection: Collection) -> Option<PreviousRun> {
    if !path.exists() {
        return None;
    }
    match store::read_json::<UpdateReport>(path) {
        Ok(r) if r.collection == collection => Some(PreviousRun {
            ran_at: r.ran_at,
            new_items: r.new_items,
            updated_items: r.updated_items,
        }),
        Ok(_) => None,
        Err(e) => {
            warn!("Ignoring unreadable previous report: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;

    fn product(v: serde_json::Value) -> CanonicalProduct {
        serde_json::from_value(v).unwrap()
    }

    fn opts(dir: &Path, execute: bool) -> MergeOptions {
        let run_date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        MergeOptions {
            execute,
            backup: true,
            replace: false,
            backup_dir: dir.join("backups"),
            run_date,
            now: run_date.and_hms_opt(8, 0, 0).unwrap(),
        }
    }

    fn store() -> Vec<CanonicalProduct> {
        vec![
            product(json!({ "id": "a", "sources": ["x"], "lastUpdated": "2025-01-10" })),
            product(json!({ "id": "b", "sources": ["x"], "addedDate": "2025-01-10" })),
        ]
    }

    #[test]
    fn only_strictly_newer_records_update() {
        let incoming = vec![
            product(json!({ "id": "a", "lastUpdated": "2025-01-10" })),
            product(json!({ "id": "b", "lastUpdated": "2025-02-01" })),
            product(json!({ "id": "c" })),
            product(json!({ "id": "a" })),
        ];
        let p = plan(&store(), incoming);
        assert_eq!(p.new_items.len(), 1);
        assert_eq!(p.updated_items.len(), 1);
        assert_eq!(p.updated_items[0].id, "b");
        assert_eq!(p.stale, vec!["a", "a"]);
    }

    #[test]
    fn dry_run_reports_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pens.json");
        let before = serde_json::to_string(&json!({ "pens": store() })).unwrap();
        fs::write(&store_path, &before).unwrap();

        let incoming = vec![product(json!({ "id": "c", "sources": ["y"] }))];
        let report = run(&store_path, Collection::Pens, incoming, &opts(dir.path(), false), None).unwrap();
        assert!(report.dry_run);
        assert_eq!(report.new_items, 1);
        assert!(report.merge.is_none());
        assert_eq!(fs::read_to_string(&store_path).unwrap(), before);
    }

    #[test]
    fn execute_merges_subset_and_compares_with_previous_report() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("pens.json");
        fs::write(&store_path, serde_json::to_string(&json!({ "pens": store() })).unwrap()).unwrap();
        let report_path: PathBuf = dir.path().join("update-report.json");

        let incoming = vec![
            product(json!({ "id": "b", "sources": ["y"], "name": "B", "lastUpdated": "2025-02-01" })),
            product(json!({ "id": "a", "sources": ["y"], "name": "ignored", "lastUpdated": "2024-12-01" })),
        ];
        let first = run(&store_path, Collection::Pens, incoming, &opts(dir.path(), true), Some(&report_path)).unwrap();
        assert_eq!(first.merge.as_ref().unwrap().updated_count, 1);
        assert!(first.previous.is_none());

        let doc = CatalogDocument::load(&store_path, Collection::Pens).unwrap();
        assert_eq!(doc.products[0].name, None);
        assert_eq!(doc.products[1].name.as_deref(), Some("B"));
        assert_eq!(doc.products[1].sources, vec!["x", "y"]);

        let second = run(&store_path, Collection::Pens, vec![], &opts(dir.path(), false), Some(&report_path)).unwrap();
        assert_eq!(second.previous.unwrap().updated_items, 1);
    }
}
