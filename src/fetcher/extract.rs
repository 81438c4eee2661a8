use std::collections::{BTreeMap, HashSet};

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::error::FetchError;
use crate::text::{clean_text, extract_price, resolve_url};

/// Target field → CSS selector. A selector may end in `@attr` to read an
/// attribute instead of the element text.
pub type FieldMapping = BTreeMap<String, String>;

/// Fields pulled from one page, keyed by target field name.
pub type PartialRecord = BTreeMap<String, Value>;

pub const DEFAULT_PRODUCT_LINK_SELECTORS: &[&str] = &[
    "a[href*=\"/product\"]",
    "a[href*=\"/p/\"]",
    ".product-item a",
    ".product-link",
    "a.product-title",
];

fn parse_selector(raw: &str) -> Result<Selector, FetchError> {
    Selector::parse(raw).map_err(|e| FetchError::Parse(format!("invalid selector '{raw}': {e}")))
}

/// Split `img.main@data-src` into (`img.main`, Some("data-src")).
fn split_attr(raw: &str) -> (&str, Option<&str>) {
    match raw.rsplit_once('@') {
        Some((sel, attr))
            if !attr.is_empty()
                && attr.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            (sel.trim(), Some(attr))
        }
        _ => (raw.trim(), None),
    }
}

fn element_text(el: &ElementRef) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn image_src(el: &ElementRef) -> Option<String> {
    let v = el.value();
    v.attr("src")
        .or_else(|| v.attr("data-src"))
        .or_else(|| v.attr("content"))
        .or_else(|| v.attr("href"))
        .map(str::to_string)
}

/// Pure extraction of mapped fields from a parsed page. Selectors that match
/// nothing leave their field unset.
pub fn extract(document: &Html, mapping: &FieldMapping, base_url: &str) -> Result<PartialRecord, FetchError> {
    if mapping.is_empty() {
        return Ok(extract_generic(document));
    }

    let mut record = PartialRecord::new();

    for (field, raw_selector) in mapping {
        let (sel, attr) = split_attr(raw_selector);
        let selector = parse_selector(sel)?;

        match field.as_str() {
            "images" => {
                let mut seen = HashSet::new();
                let urls: Vec<Value> = document
                    .select(&selector)
                    .filter_map(|el| match attr {
                        Some(a) => el.value().attr(a).map(str::to_string),
                        None => image_src(&el),
                    })
                    .filter_map(|src| resolve_url(base_url, &src))
                    .filter(|u| seen.insert(u.clone()))
                    .map(Value::String)
                    .collect();
                if !urls.is_empty() {
                    record.insert(field.clone(), Value::Array(urls));
                }
            }
            "tags" => {
                let tags: Vec<Value> = document
                    .select(&selector)
                    .map(|el| element_text(&el))
                    .filter(|t| !t.is_empty())
                    .map(Value::String)
                    .collect();
                if !tags.is_empty() {
                    record.insert(field.clone(), Value::Array(tags));
                }
            }
            _ => {
                let Some(el) = document.select(&selector).next() else {
                    continue;
                };
                let text = match attr {
                    Some(a) => el.value().attr(a).map(clean_text).unwrap_or_default(),
                    None => element_text(&el),
                };
                if text.is_empty() {
                    continue;
                }
                if field == "price" {
                    if let Some(n) = extract_price(&text).and_then(serde_json::Number::from_f64) {
                        record.insert(field.clone(), Value::Number(n));
                    }
                } else if field == "url" || field == "image" {
                    if let Some(u) = resolve_url(base_url, &text) {
                        record.insert(field.clone(), Value::String(u));
                    }
                } else {
                    record.insert(field.clone(), Value::String(text));
                }
            }
        }
    }

    Ok(record)
}

/// Fallback for sources without a mapping: page title and meta description.
fn extract_generic(document: &Html) -> PartialRecord {
    let mut record = PartialRecord::new();
    if let Ok(sel) = Selector::parse("title") {
        if let Some(t) = document.select(&sel).next().map(|el| element_text(&el)) {
            if !t.is_empty() {
                record.insert("title".into(), Value::String(t));
            }
        }
    }
    if let Ok(sel) = Selector::parse("meta[name=\"description\"]") {
        if let Some(d) = document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(clean_text)
            .filter(|d| !d.is_empty())
        {
            record.insert("description".into(), Value::String(d));
        }
    }
    record
}

/// Product links on a listing page, absolute and deduplicated in page order.
pub fn extract_links(document: &Html, selectors: &[String], base_url: &str) -> Result<Vec<String>, FetchError> {
    let defaults: Vec<String>;
    let selectors = if selectors.is_empty() {
        defaults = DEFAULT_PRODUCT_LINK_SELECTORS.iter().map(|s| s.to_string()).collect();
        &defaults
    } else {
        selectors
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for raw in selectors {
        let selector = parse_selector(raw)?;
        for el in document.select(&selector) {
            let Some(href) = el.value().attr("href") else {
                continue;
            };
            if href.starts_with('#') || href.starts_with("javascript:") {
                continue;
            }
            if let Some(abs) = resolve_url(base_url, href) {
                if seen.insert(abs.clone()) {
                    links.push(abs);
                }
            }
        }
    }
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = "https://shop.test";

    fn page(name: &str) -> Html {
        let html = std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap();
        Html::parse_document(&html)
    }

    fn mapping() -> FieldMapping {
        [
            ("name", "h1.product-title"),
            ("brand", ".product-brand"),
            ("price", ".price"),
            ("description", ".product-description"),
            ("images", ".gallery img"),
            ("sku", ".sku"),
            ("color", ".ink-color"),
            ("url", "link[rel=canonical]@href"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn mapped_fields_from_product_page() {
        let rec = extract(&page("product_page"), &mapping(), BASE).unwrap();
        assert_eq!(rec["name"], json!("Custom 823 Amber"));
        assert_eq!(rec["brand"], json!("Pilot"));
        assert_eq!(rec["price"], json!(288.0));
        assert_eq!(
            rec["description"],
            json!("A vacuum-filling pen with a 14k gold nib & amber demonstrator body.")
        );
        assert_eq!(
            rec["images"],
            json!([
                "https://shop.test/img/823-amber-main.jpg",
                "https://cdn.shop.test/823-amber-side.jpg"
            ])
        );
        assert_eq!(rec["url"], json!("https://shop.test/products/pilot-custom-823-amber"));
    }

    #[test]
    fn absent_selectors_leave_fields_unset() {
        let rec = extract(&page("product_page"), &mapping(), BASE).unwrap();
        assert!(!rec.contains_key("sku"));
        assert!(!rec.contains_key("color"));
    }

    #[test]
    fn generic_fallback_uses_title_and_meta() {
        let rec = extract(&page("product_page"), &FieldMapping::new(), BASE).unwrap();
        assert_eq!(rec["title"], json!("Pilot Custom 823 Amber | Shop Test"));
        assert_eq!(rec["description"], json!("Pilot Custom 823 in amber, vacuum filler."));
    }

    #[test]
    fn bad_selector_is_a_parse_error() {
        let mut m = FieldMapping::new();
        m.insert("name".into(), "h1[[".into());
        let err = extract(&page("product_page"), &m, BASE).unwrap_err();
        assert_eq!(err.class(), "parse");
    }

    #[test]
    fn product_links_from_category_page() {
        let links = extract_links(&page("category_page"), &[], BASE).unwrap();
        assert_eq!(
            links,
            vec![
                "https://shop.test/products/lamy-safari-charcoal".to_string(),
                "https://shop.test/products/twsbi-eco-clear".to_string(),
                "https://shop.test/p/sailor-pro-gear-slim".to_string(),
            ]
        );
    }

    #[test]
    fn attribute_suffix_parsing() {
        assert_eq!(split_attr("meta[property=og:image]@content"), ("meta[property=og:image]", Some("content")));
        assert_eq!(split_attr("h1.title"), ("h1.title", None));
    }
}
