use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::PriceBands;
use crate::model::{
    CanonicalProduct, Collection, Images, PurchaseLink, RawRecord, SpecValue, Specifications,
};
use crate::text::{clean_opt, clean_text, extract_price, slugify};

static INK_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\binks?\b").unwrap());

/// Decide which store document a raw record belongs to.
pub fn route(raw: &RawRecord) -> Collection {
    for key in ["kind", "category"] {
        if let Some(hint) = raw.text(key).map(|s| s.to_lowercase()) {
            if hint.contains("ink") {
                return Collection::Inks;
            }
            if hint.contains("pen") {
                return Collection::Pens;
            }
        }
    }
    if raw.url.as_deref().is_some_and(|u| u.to_lowercase().contains("/ink")) {
        return Collection::Inks;
    }
    let name = raw.text("name").or_else(|| raw.text("title"));
    if name.is_some_and(|n| INK_WORD_RE.is_match(&n)) {
        return Collection::Inks;
    }
    Collection::Pens
}

/// A mapped record and whether its id had to be synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapped {
    pub collection: Collection,
    pub product: CanonicalProduct,
    pub needs_review: bool,
}

/// Convert a raw record into the canonical schema. Pure: the same record
/// always yields the same id and fields.
pub fn map(raw: &RawRecord, source_id: &str, bands: &PriceBands) -> Mapped {
    let collection = route(raw);

    let brand = clean_opt(raw.text("brand").as_deref());
    let model = clean_opt(raw.text("model").as_deref());
    let name = clean_opt(raw.text("name").or_else(|| raw.text("title")).as_deref());

    let slug = slugify(&[
        brand.as_deref().unwrap_or(""),
        model.as_deref().unwrap_or(""),
        name.as_deref().unwrap_or(""),
    ]);
    let needs_review = slug.is_empty();
    let id = if needs_review {
        synthetic_id(raw, collection)
    } else {
        slug
    };

    let price = raw_price(raw);
    let url = raw.url.clone().or_else(|| raw.text("url"));

    let mut product = CanonicalProduct {
        id: id.clone(),
        slug: Some(id),
        brand,
        name,
        model,
        kind: clean_opt(raw.text("type").as_deref()),
        description: clean_opt(raw.text("description").as_deref()),
        details: clean_opt(raw.text("details").as_deref()),
        color: clean_opt(raw.text("color").or_else(|| raw.text("colour")).as_deref()),
        specifications: raw_specifications(raw),
        images: raw_images(raw),
        sources: vec![source_id.to_string()],
        ..Default::default()
    };

    if price.is_some() || url.is_some() {
        product.purchase_links = Some(vec![PurchaseLink {
            name: source_id.to_string(),
            url: url.unwrap_or_default(),
            price,
            currency: Some("USD".into()),
            region: Some("US".into()),
            availability: Some("Unknown".into()),
            ..Default::default()
        }]);
    }

    let mut tags: Vec<String> = Vec::new();
    if let Some(Value::Array(raw_tags)) = raw.fields.get("tags") {
        tags.extend(raw_tags.iter().filter_map(Value::as_str).map(clean_text));
    }
    if let Some(b) = &product.brand {
        tags.push(b.to_lowercase());
    }
    if let Some(p) = price {
        tags.push(bands.tag_for(p).to_string());
    }
    if collection == Collection::Inks && product.color.is_some() {
        tags.push("colored".to_string());
    }
    let mut seen = std::collections::HashSet::new();
    tags.retain(|t| !t.is_empty() && seen.insert(t.clone()));
    if !tags.is_empty() {
        product.tags = Some(tags);
    }

    Mapped {
        collection,
        product,
        needs_review,
    }
}

/// `<kind>-unnamed-<hash>` from the record content, so a re-fetch of the
/// same nameless page maps to the same id.
fn synthetic_id(raw: &RawRecord, collection: Collection) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(raw.source_id.as_bytes());
    hasher.update(raw.url.as_deref().unwrap_or("").as_bytes());
    if let Ok(bytes) = serde_json::to_vec(&raw.fields) {
        hasher.update(&bytes);
    }
    let hex = hasher.finalize().to_hex();
    format!("{}-unnamed-{}", collection.id_prefix(), &hex[..12])
}

fn raw_price(raw: &RawRecord) -> Option<f64> {
    match raw.fields.get("price")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => extract_price(s),
        _ => None,
    }
    .filter(|p| *p > 0.0)
}

fn raw_images(raw: &RawRecord) -> Option<Images> {
    let mut urls: Vec<String> = match raw.fields.get("images") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };
    if urls.is_empty() {
        urls.extend(raw.text("image"));
    }
    if urls.is_empty() {
        return None;
    }
    let main = urls.remove(0);
    Some(Images {
        main: Some(main),
        gallery: urls,
    })
}

/// Type the raw specification bag: lengths and weights become numbers,
/// material a list, everything else flattens to the closed value set.
fn raw_specifications(raw: &RawRecord) -> Option<Specifications> {
    let Some(Value::Object(map)) = raw.fields.get("specifications") else {
        return None;
    };
    let mut specs = Specifications::new();
    for (key, value) in map {
        match (key.as_str(), value) {
            ("length" | "weight", Value::String(s)) => {
                if let Some(n) = extract_price(s).and_then(SpecValue::from_f64) {
                    specs.insert(key.clone(), n);
                }
            }
            ("material", Value::String(s)) if !s.trim().is_empty() => {
                specs.insert(key.clone(), SpecValue::List(vec![s.trim().to_string()]));
            }
            _ => specs.extend(SpecValue::flatten_json(key, value)),
        }
    }
    Some(specs)
}

/// Record whose id was synthesized and cannot be merged deterministically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    pub collection: Collection,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Pens and inks document passed between the map, clean and validate stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pens: Vec<CanonicalProduct>,
    #[serde(default)]
    pub inks: Vec<CanonicalProduct>,
    #[serde(default)]
    pub needs_review: Vec<ReviewItem>,
}

impl ProductBatch {
    pub fn collection(&self, c: Collection) -> &[CanonicalProduct] {
        match c {
            Collection::Pens => &self.pens,
            Collection::Inks => &self.inks,
        }
    }

    pub fn collection_mut(&mut self, c: Collection) -> &mut Vec<CanonicalProduct> {
        match c {
            Collection::Pens => &mut self.pens,
            Collection::Inks => &mut self.inks,
        }
    }
}

/// Map a whole fetch batch, records keep their input order within each collection.
pub fn map_batch(records: &[RawRecord], bands: &PriceBands, generated_at: DateTime<Utc>) -> ProductBatch {
    let mapped: Vec<Mapped> = records
        .par_iter()
        .map(|r| map(r, &r.source_id, bands))
        .collect();

    let mut batch = ProductBatch {
        generated_at: Some(generated_at),
        ..Default::default()
    };
    for (m, raw) in mapped.into_iter().zip(records) {
        if m.needs_review {
            warn!("{}: no naming fields, assigned {}", raw.source_id, m.product.id);
            batch.needs_review.push(ReviewItem {
                id: m.product.id.clone(),
                collection: m.collection,
                source_id: raw.source_id.clone(),
                url: raw.url.clone(),
            });
        }
        batch.collection_mut(m.collection).push(m.product);
    }

    info!(
        "Mapped {} pens and {} inks ({} need review)",
        batch.pens.len(),
        batch.inks.len(),
        batch.needs_review.len()
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn raw(fields: Value, url: Option<&str>) -> RawRecord {
        let mut r = RawRecord::new(
            "goulet",
            url.map(str::to_string),
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        );
        r.fields = serde_json::from_value(fields).unwrap();
        r
    }

    #[test]
    fn id_from_brand_model_name() {
        let r = raw(
            json!({ "brand": "Pilot", "model": "Custom 823", "name": "Amber" }),
            Some("https://www.gouletpens.com/products/pilot-custom-823-amber"),
        );
        let m = map(&r, "goulet", &PriceBands::default());
        assert_eq!(m.product.id, "pilot-custom-823-amber");
        assert_eq!(m.product.slug.as_deref(), Some("pilot-custom-823-amber"));
        assert!(!m.needs_review);
        assert_eq!(m.collection, Collection::Pens);
    }

    #[test]
    fn mapping_is_deterministic() {
        let r = raw(json!({ "title": "<b>Lamy</b> Safari", "price": "$29.60" }), None);
        let a = map(&r, "goulet", &PriceBands::default());
        let b = map(&r, "goulet", &PriceBands::default());
        assert_eq!(a, b);
        assert_eq!(a.product.name.as_deref(), Some("Lamy Safari"));
    }

    #[test]
    fn synthetic_id_is_stable_and_flagged() {
        let r = raw(json!({ "description": "mystery item" }), Some("https://shop.test/x"));
        let a = map(&r, "goulet", &PriceBands::default());
        let b = map(&r, "goulet", &PriceBands::default());
        assert!(a.needs_review);
        assert!(a.product.id.starts_with("pen-unnamed-"));
        assert_eq!(a.product.id, b.product.id);

        let other = raw(json!({ "description": "another" }), Some("https://shop.test/x"));
        assert_ne!(map(&other, "goulet", &PriceBands::default()).product.id, a.product.id);
    }

    #[test]
    fn price_and_url_become_a_purchase_link() {
        let r = raw(
            json!({ "brand": "Pilot", "name": "Custom 823", "price": 288.0 }),
            Some("https://shop.test/products/823"),
        );
        let p = map(&r, "goulet", &PriceBands::default()).product;
        let links = p.purchase_links.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "goulet");
        assert_eq!(links[0].url, "https://shop.test/products/823");
        assert_eq!(links[0].price, Some(288.0));
        assert_eq!(links[0].currency.as_deref(), Some("USD"));
        assert_eq!(links[0].availability.as_deref(), Some("Unknown"));
        assert_eq!(p.tags.unwrap(), vec!["pilot", "luxury"]);
        assert_eq!(p.sources, vec!["goulet"]);
    }

    #[test]
    fn images_and_specifications() {
        let r = raw(
            json!({
                "name": "Safari",
                "images": ["https://a.test/1.jpg", "https://a.test/2.jpg"],
                "specifications": {
                    "length": "139.5 mm",
                    "weight": 17,
                    "material": "ABS",
                    "fillingSystem": "Cartridge/Converter",
                    "nib": { "size": "F", "material": "steel" }
                }
            }),
            None,
        );
        let p = map(&r, "goulet", &PriceBands::default()).product;
        let images = p.images.unwrap();
        assert_eq!(images.main.as_deref(), Some("https://a.test/1.jpg"));
        assert_eq!(images.gallery, vec!["https://a.test/2.jpg"]);

        let specs = p.specifications.unwrap();
        assert_eq!(specs["length"], SpecValue::from_f64(139.5).unwrap());
        assert_eq!(specs["weight"], SpecValue::Number(17.into()));
        assert_eq!(serde_json::to_value(&specs["weight"]).unwrap(), json!(17));
        assert_eq!(specs["material"], SpecValue::List(vec!["ABS".into()]));
        assert_eq!(specs["nib.size"], SpecValue::Text("F".into()));
    }

    #[test]
    fn routing_rules() {
        assert_eq!(route(&raw(json!({ "kind": "ink" }), None)), Collection::Inks);
        assert_eq!(route(&raw(json!({ "category": "Fountain Pens" }), None)), Collection::Pens);
        assert_eq!(
            route(&raw(json!({ "name": "Oxblood" }), Some("https://shop.test/inks/oxblood"))),
            Collection::Inks
        );
        assert_eq!(route(&raw(json!({ "name": "Diamine Oxblood Ink 80ml" }), None)), Collection::Inks);
        assert_eq!(route(&raw(json!({ "name": "Pink Safari" }), None)), Collection::Pens);
    }

    #[test]
    fn colored_ink_tag() {
        let r = raw(json!({ "brand": "Diamine", "name": "Oxblood Ink", "color": "#6b0f1a" }), None);
        let m = map(&r, "goulet", &PriceBands::default());
        assert_eq!(m.collection, Collection::Inks);
        assert_eq!(m.product.tags.unwrap(), vec!["diamine", "colored"]);
    }

    #[test]
    fn batch_splits_collections_and_lists_review_items() {
        let records = vec![
            raw(json!({ "brand": "Lamy", "name": "Safari" }), None),
            raw(json!({ "brand": "Diamine", "name": "Oxblood", "kind": "ink" }), None),
            raw(json!({ "price": 12 }), Some("https://shop.test/p/1")),
        ];
        let batch = map_batch(&records, &PriceBands::default(), Utc::now());
        assert_eq!(batch.pens.len(), 2);
        assert_eq!(batch.inks.len(), 1);
        assert_eq!(batch.needs_review.len(), 1);
        assert_eq!(batch.needs_review[0].url.as_deref(), Some("https://shop.test/p/1"));
    }
}
