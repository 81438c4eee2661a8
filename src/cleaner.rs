use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::mapper::ProductBatch;
use crate::model::{CanonicalProduct, Collection, Images, SpecValue};
use crate::text::{clean_opt, is_valid_url, slugify};

/// What the cleaner removed from one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanStats {
    pub input: usize,
    pub output: usize,
    /// Entries that could not be read as a product at all.
    pub malformed: usize,
    pub dropped_unnamed: usize,
    pub duplicates: usize,
    pub links_dropped: usize,
    pub images_dropped: usize,
}

/// Backfill, normalize and deduplicate one collection. No network access.
pub fn clean(
    products: Vec<CanonicalProduct>,
    collection: Collection,
    run_date: NaiveDate,
) -> (Vec<CanonicalProduct>, CleanStats) {
    let mut stats = CleanStats {
        input: products.len(),
        ..Default::default()
    };
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(products.len());

    for mut product in products {
        normalize(&mut product);
        backfill(&mut product, collection, run_date);
        let (links, images) = drop_bad_urls(&mut product);
        stats.links_dropped += links;
        stats.images_dropped += images;

        if product.name.is_none() && product.brand.is_none() {
            debug!("Dropping {}: no name and no brand", product.id);
            stats.dropped_unnamed += 1;
            continue;
        }
        if !seen.insert(product.id.clone()) {
            debug!("Dropping duplicate {}", product.id);
            stats.duplicates += 1;
            continue;
        }
        out.push(product);
    }

    stats.output = out.len();
    info!(
        "Cleaned {}: {} in, {} out ({} unnamed, {} duplicates, {} bad links, {} bad images)",
        collection,
        stats.input,
        stats.output,
        stats.dropped_unnamed,
        stats.duplicates,
        stats.links_dropped,
        stats.images_dropped
    );
    (out, stats)
}

/// Clean both collections of a batch. Review notes from mapping are kept.
pub fn clean_batch(batch: ProductBatch, run_date: NaiveDate) -> (ProductBatch, Vec<(Collection, CleanStats)>) {
    let ProductBatch {
        generated_at,
        pens,
        inks,
        needs_review,
    } = batch;
    let (pens, pen_stats) = clean(pens, Collection::Pens, run_date);
    let (inks, ink_stats) = clean(inks, Collection::Inks, run_date);
    (
        ProductBatch {
            generated_at,
            pens,
            inks,
            needs_review,
        },
        vec![(Collection::Pens, pen_stats), (Collection::Inks, ink_stats)],
    )
}

/// Clean a mapped document read as plain JSON. Each entry is read on its own:
/// the common shape slips are coerced first, and entries that still do not
/// parse are dropped and counted as malformed.
pub fn clean_document(doc: &Value, run_date: NaiveDate) -> (ProductBatch, Vec<(Collection, CleanStats)>) {
    let mut batch = ProductBatch {
        generated_at: doc
            .get("generatedAt")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        needs_review: doc
            .get("needsReview")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        ..Default::default()
    };

    let mut stats = Vec::with_capacity(Collection::ALL.len());
    for collection in Collection::ALL {
        let entries = doc
            .get(collection.key())
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut products = Vec::with_capacity(entries.len());
        let mut malformed = 0;
        for (i, entry) in entries.iter().enumerate() {
            match serde_json::from_value::<CanonicalProduct>(coerce(entry.clone())) {
                Ok(p) => products.push(p),
                Err(e) => {
                    warn!("Dropping {}[{}]: {}", collection, i, e);
                    malformed += 1;
                }
            }
        }
        let (cleaned, mut s) = clean(products, collection, run_date);
        s.input += malformed;
        s.malformed = malformed;
        *batch.collection_mut(collection) = cleaned;
        stats.push((collection, s));
    }
    (batch, stats)
}

/// Repair the shape slips hand-curated entries tend to have: a bare image URL
/// or URL list, and a single purchase link given as a string or an object.
fn coerce(mut entry: Value) -> Value {
    let Some(obj) = entry.as_object_mut() else {
        return entry;
    };
    if let Some(images) = obj.get_mut("images") {
        match images.take() {
            Value::String(url) => *images = json!({ "main": url }),
            Value::Array(urls) => {
                let mut urls = urls.into_iter();
                *images = json!({ "main": urls.next(), "gallery": urls.collect::<Vec<_>>() });
            }
            other => *images = other,
        }
    }
    if let Some(links) = obj.get_mut("purchaseLinks") {
        match links.take() {
            Value::String(url) => *links = json!([{ "url": url }]),
            Value::Object(link) => *links = Value::Array(vec![Value::Object(link)]),
            other => *links = other,
        }
    }
    entry
}

fn backfill(p: &mut CanonicalProduct, collection: Collection, run_date: NaiveDate) {
    if p.id.trim().is_empty() {
        p.id = slugify(&[
            p.brand.as_deref().unwrap_or(""),
            p.model.as_deref().unwrap_or(""),
            p.name.as_deref().unwrap_or(""),
        ]);
    }
    if p.slug.is_none() {
        p.slug = Some(p.id.clone());
    }
    p.kind.get_or_insert_with(|| collection.default_type().to_string());
    p.specifications.get_or_insert_with(Default::default);
    p.images.get_or_insert_with(Images::default);
    p.purchase_links.get_or_insert_with(Vec::new);
    p.tags.get_or_insert_with(Vec::new);
    p.verified.get_or_insert(false);

    let added = *p.added_date.get_or_insert(run_date);
    let updated = p.last_updated.get_or_insert(run_date);
    if *updated < added {
        *updated = added;
    }
}

fn normalize(p: &mut CanonicalProduct) {
    for field in [
        &mut p.name,
        &mut p.brand,
        &mut p.model,
        &mut p.kind,
        &mut p.description,
        &mut p.details,
        &mut p.color,
    ] {
        *field = clean_opt(field.as_deref());
    }

    if let Some(specs) = p.specifications.as_mut() {
        if let Some(SpecValue::Text(s)) = specs.get("material") {
            let list = split_list(s);
            specs.insert("material".to_string(), SpecValue::List(list));
        }
        for value in specs.values_mut() {
            if let SpecValue::List(items) = value {
                dedup_in_order(items);
            }
        }
        specs.retain(|_, v| !v.is_empty());
    }

    if let Some(tags) = p.tags.as_mut() {
        for t in tags.iter_mut() {
            *t = t.trim().to_string();
        }
        tags.retain(|t| !t.is_empty());
        dedup_in_order(tags);
    }

    dedup_in_order(&mut p.sources);
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|i| seen.insert(i.clone()));
}

/// Syntactic URL check only; returns (links dropped, images dropped).
fn drop_bad_urls(p: &mut CanonicalProduct) -> (usize, usize) {
    let mut links_dropped = 0;
    if let Some(links) = p.purchase_links.as_mut() {
        let before = links.len();
        links.retain(|l| is_valid_url(&l.url));
        links_dropped = before - links.len();
    }

    let mut images_dropped = 0;
    if let Some(images) = p.images.as_mut() {
        if images.main.as_deref().is_some_and(|u| !is_valid_url(u)) {
            images.main = None;
            images_dropped += 1;
        }
        let before = images.gallery.len();
        images.gallery.retain(|u| is_valid_url(u));
        images_dropped += before - images.gallery.len();
    }
    (links_dropped, images_dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PurchaseLink;
    use serde_json::json;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn product(v: serde_json::Value) -> CanonicalProduct {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn same_derived_id_is_kept_once() {
        let batch = vec![product(json!({ "name": "Pen A" })), product(json!({ "name": "Pen A" }))];
        let (out, stats) = clean(batch, Collection::Pens, date("2025-01-15"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "pen-a");
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn first_duplicate_wins() {
        let batch = vec![
            product(json!({ "id": "lamy-safari", "name": "Safari", "description": "first" })),
            product(json!({ "id": "lamy-safari", "name": "Safari", "description": "second" })),
        ];
        let (out, _) = clean(batch, Collection::Pens, date("2025-01-15"));
        assert_eq!(out[0].description.as_deref(), Some("first"));
    }

    #[test]
    fn nameless_brandless_record_is_dropped() {
        let batch = vec![
            product(json!({ "id": "x", "description": "orphan" })),
            product(json!({ "brand": "Lamy" })),
        ];
        let (out, stats) = clean(batch, Collection::Pens, date("2025-01-15"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "lamy");
        assert_eq!(stats.dropped_unnamed, 1);
    }

    #[test]
    fn backfills_required_shapes_and_dates() {
        let (out, _) = clean(
            vec![product(json!({ "brand": "Diamine", "name": "Oxblood" }))],
            Collection::Inks,
            date("2025-01-15"),
        );
        let p = &out[0];
        assert_eq!(p.kind.as_deref(), Some("Dye-based"));
        assert_eq!(p.slug.as_deref(), Some("diamine-oxblood"));
        assert_eq!(p.images, Some(Images::default()));
        assert_eq!(p.purchase_links, Some(vec![]));
        assert_eq!(p.tags, Some(vec![]));
        assert_eq!(p.verified, Some(false));
        assert_eq!(p.added_date, Some(date("2025-01-15")));
        assert_eq!(p.last_updated, Some(date("2025-01-15")));
        assert!(p.sources.is_empty());
    }

    #[test]
    fn last_updated_never_precedes_added_date() {
        let (out, _) = clean(
            vec![product(json!({
                "name": "Safari",
                "addedDate": "2025-02-01",
                "lastUpdated": "2024-12-31"
            }))],
            Collection::Pens,
            date("2025-03-01"),
        );
        assert_eq!(out[0].last_updated, Some(date("2025-02-01")));
    }

    #[test]
    fn normalizes_text_material_and_tags() {
        let (out, _) = clean(
            vec![product(json!({
                "name": "  Custom <em>74</em> ",
                "brand": "Pilot",
                "specifications": { "material": "resin, gold" },
                "tags": "demonstrator, demonstrator , gold"
            }))],
            Collection::Pens,
            date("2025-01-15"),
        );
        let p = &out[0];
        assert_eq!(p.name.as_deref(), Some("Custom 74"));
        assert_eq!(
            p.specifications.as_ref().unwrap()["material"],
            SpecValue::List(vec!["resin".into(), "gold".into()])
        );
        assert_eq!(p.tags.as_ref().unwrap(), &vec!["demonstrator".to_string(), "gold".to_string()]);
    }

    #[test]
    fn unreadable_entry_is_dropped_and_the_rest_survive() {
        let doc = json!({
            "pens": [
                { "name": "Safari", "brand": "Lamy" },
                { "name": "Custom 74", "brand": "Pilot", "tags": 5 },
                "not an object"
            ],
            "inks": [{ "name": "Oxblood", "brand": "Diamine" }]
        });
        let (batch, stats) = clean_document(&doc, date("2025-01-15"));
        assert_eq!(batch.pens.len(), 1);
        assert_eq!(batch.pens[0].id, "lamy-safari");
        assert_eq!(batch.inks.len(), 1);
        let (collection, pens) = &stats[0];
        assert_eq!(*collection, Collection::Pens);
        assert_eq!(pens.input, 3);
        assert_eq!(pens.malformed, 2);
        assert_eq!(pens.output, 1);
        assert_eq!(stats[1].1.malformed, 0);
    }

    #[test]
    fn bare_image_and_link_strings_are_coerced() {
        let doc = json!({
            "pens": [
                { "name": "Custom 74", "brand": "Pilot", "images": "https://a.test/1.jpg" },
                {
                    "name": "Safari",
                    "brand": "Lamy",
                    "images": ["https://a.test/2.jpg", "https://a.test/3.jpg"],
                    "purchaseLinks": "https://shop.test/safari"
                }
            ]
        });
        let (batch, stats) = clean_document(&doc, date("2025-01-15"));
        assert_eq!(stats[0].1.malformed, 0);
        let custom = &batch.pens[0];
        assert_eq!(custom.images.as_ref().unwrap().main.as_deref(), Some("https://a.test/1.jpg"));
        let safari = &batch.pens[1];
        let images = safari.images.as_ref().unwrap();
        assert_eq!(images.main.as_deref(), Some("https://a.test/2.jpg"));
        assert_eq!(images.gallery, vec!["https://a.test/3.jpg"]);
        assert_eq!(safari.links()[0].url, "https://shop.test/safari");
    }

    #[test]
    fn document_metadata_is_kept() {
        let doc = json!({
            "generatedAt": "2025-04-02T06:00:00Z",
            "pens": [],
            "needsReview": [{ "id": "pen-unnamed-abc", "collection": "pens", "sourceId": "shop" }]
        });
        let (batch, _) = clean_document(&doc, date("2025-01-15"));
        assert!(batch.generated_at.is_some());
        assert_eq!(batch.needs_review.len(), 1);
    }

    #[test]
    fn malformed_urls_are_dropped() {
        let mut p = product(json!({
            "name": "Safari",
            "images": { "main": "not a url", "gallery": ["https://a.test/1.jpg", "/relative.jpg"] }
        }));
        p.purchase_links = Some(vec![
            PurchaseLink {
                name: "ok".into(),
                url: "https://shop.test/safari".into(),
                ..Default::default()
            },
            PurchaseLink {
                name: "bad".into(),
                url: "".into(),
                ..Default::default()
            },
        ]);
        let (out, stats) = clean(vec![p], Collection::Pens, date("2025-01-15"));
        let p = &out[0];
        assert_eq!(p.links().len(), 1);
        assert_eq!(p.images.as_ref().unwrap().main, None);
        assert_eq!(p.images.as_ref().unwrap().gallery, vec!["https://a.test/1.jpg"]);
        assert_eq!(stats.links_dropped, 1);
        assert_eq!(stats.images_dropped, 2);
    }
}
