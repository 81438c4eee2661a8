use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::QualitySettings;
use crate::links::is_placeholder;
use crate::model::{CanonicalProduct, Collection};

const MISSING_REQUIRED: i32 = 15;
const WEAK_OPTIONAL: i32 = 5;
const PRICE_BONUS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Band {
    pub fn of(score: u8) -> Self {
        match score {
            90.. => Band::Excellent,
            70..=89 => Band::Good,
            50..=69 => Band::Fair,
            _ => Band::Poor,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Band::Excellent => "excellent",
            Band::Good => "good",
            Band::Fair => "fair",
            Band::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub field: String,
    /// Short issue label used for aggregation, e.g. "missing brand".
    pub issue: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub score: u8,
    pub findings: Vec<Finding>,
}

fn present(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Weighted completeness score in `0..=100` plus the findings behind it.
pub fn assess(p: &CanonicalProduct, collection: Collection, settings: &QualitySettings) -> Assessment {
    let mut score: i32 = 100;
    let mut findings = Vec::new();
    let mut missing = |field: &str, suggestion: String| {
        findings.push(Finding {
            field: field.to_string(),
            issue: format!("missing {field}"),
            suggestion,
        });
    };

    if p.id.trim().is_empty() {
        score -= MISSING_REQUIRED;
        missing("id", "Derive an id from brand, model and name".into());
    }
    if !present(&p.name) {
        score -= MISSING_REQUIRED;
        missing("name", "Add the product name as printed by the manufacturer".into());
    }
    if !present(&p.brand) {
        score -= MISSING_REQUIRED;
        missing("brand", "Add the brand (e.g. Pilot, Lamy, Diamine)".into());
    }
    if !present(&p.kind) {
        score -= MISSING_REQUIRED;
        missing(
            "type",
            format!("Set type (default for {} is \"{}\")", collection, collection.default_type()),
        );
    }
    if !present(&p.description) {
        score -= MISSING_REQUIRED;
        missing(
            "description",
            format!("Write a description of at least {} characters", settings.min_description_length),
        );
    }
    if !present(&p.details) {
        score -= MISSING_REQUIRED;
        missing(
            "details",
            format!("Write details of at least {} characters", settings.min_details_length),
        );
    }

    let mut weak = |field: &str, issue: &str, suggestion: String| {
        score -= WEAK_OPTIONAL;
        findings.push(Finding {
            field: field.to_string(),
            issue: issue.to_string(),
            suggestion,
        });
    };

    if let Some(d) = p.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let len = d.chars().count();
        if len < settings.min_description_length {
            weak(
                "description",
                "short description",
                format!(
                    "Expand description to at least {} characters (currently {})",
                    settings.min_description_length, len
                ),
            );
        }
    }
    if let Some(d) = p.details.as_deref().filter(|d| !d.trim().is_empty()) {
        let len = d.chars().count();
        if len < settings.min_details_length {
            weak(
                "details",
                "short details",
                format!(
                    "Expand details to at least {} characters (currently {})",
                    settings.min_details_length, len
                ),
            );
        }
    }

    match p.images.as_ref().and_then(|i| i.main.as_deref()) {
        None => weak("images.main", "no main image", "Add a main image URL".into()),
        Some(url) if is_placeholder(url) => weak(
            "images.main",
            "placeholder main image",
            format!("Replace placeholder main image {url}"),
        ),
        Some(_) => {}
    }

    let links = p.links();
    if links.is_empty() {
        weak(
            "purchaseLinks",
            "no purchase links",
            "Add at least one retailer link with name and URL".into(),
        );
    } else if links.iter().all(|l| is_placeholder(&l.url)) {
        weak(
            "purchaseLinks",
            "placeholder purchase links",
            format!(
                "Replace placeholder purchase links: {}",
                links.iter().map(|l| l.url.as_str()).collect::<Vec<_>>().join(", ")
            ),
        );
    }

    if p.specifications.as_ref().map_or(true, |s| s.is_empty()) {
        let examples = match collection {
            Collection::Pens => "length, weight, material, filling system, nib",
            Collection::Inks => "volume, base, sheen, shading",
        };
        weak(
            "specifications",
            "no specifications",
            format!("Add specifications ({examples})"),
        );
    }
    if p.tags.as_ref().map_or(true, |t| t.is_empty()) {
        weak(
            "tags",
            "no tags",
            "Add tags such as the brand, price band or filling system".into(),
        );
    }

    if p.has_price() {
        score += PRICE_BONUS;
    }

    Assessment {
        score: score.clamp(0, 100) as u8,
        findings,
    }
}

pub fn score(p: &CanonicalProduct, collection: Collection, settings: &QualitySettings) -> u8 {
    assess(p, collection, settings).score
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCompleteness {
    pub description: usize,
    pub details: usize,
    pub main_image: usize,
    pub purchase_links: usize,
    pub specifications: usize,
    pub tags: usize,
    pub price: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCount {
    pub issue: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityItem {
    pub id: String,
    pub name: String,
    pub score: u8,
    pub band: Band,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub generated_at: DateTime<Utc>,
    pub collection: Collection,
    pub total: usize,
    pub average_score: f64,
    pub distribution: BTreeMap<Band, usize>,
    pub field_completeness: FieldCompleteness,
    pub common_issues: Vec<IssueCount>,
    pub priority: Vec<PriorityItem>,
}

/// Score every record and list the `settings.priority_limit` weakest.
pub fn report(
    products: &[CanonicalProduct],
    collection: Collection,
    settings: &QualitySettings,
    generated_at: DateTime<Utc>,
) -> QualityReport {
    let assessed: Vec<(&CanonicalProduct, Assessment)> = products
        .iter()
        .map(|p| (p, assess(p, collection, settings)))
        .collect();

    let mut distribution: BTreeMap<Band, usize> =
        [Band::Excellent, Band::Good, Band::Fair, Band::Poor]
            .into_iter()
            .map(|b| (b, 0))
            .collect();
    let mut issues: BTreeMap<String, usize> = BTreeMap::new();
    let mut completeness = FieldCompleteness::default();
    let mut sum: u64 = 0;

    for (p, a) in &assessed {
        sum += a.score as u64;
        *distribution.entry(Band::of(a.score)).or_default() += 1;
        for f in &a.findings {
            *issues.entry(f.issue.clone()).or_default() += 1;
        }
        completeness.description += present(&p.description) as usize;
        completeness.details += present(&p.details) as usize;
        completeness.main_image += p.images.as_ref().is_some_and(|i| i.main.is_some()) as usize;
        completeness.purchase_links += !p.links().is_empty() as usize;
        completeness.specifications += p.specifications.as_ref().is_some_and(|s| !s.is_empty()) as usize;
        completeness.tags += p.tags.as_ref().is_some_and(|t| !t.is_empty()) as usize;
        completeness.price += p.has_price() as usize;
    }

    let average_score = if assessed.is_empty() {
        0.0
    } else {
        (sum as f64 / assessed.len() as f64 * 10.0).round() / 10.0
    };

    let mut common_issues: Vec<IssueCount> = issues
        .into_iter()
        .map(|(issue, count)| IssueCount { issue, count })
        .collect();
    common_issues.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.issue.cmp(&b.issue)));
    common_issues.truncate(10);

    let mut ranked: Vec<&(&CanonicalProduct, Assessment)> = assessed.iter().collect();
    ranked.sort_by_key(|(_, a)| a.score);
    let priority = ranked
        .into_iter()
        .take(settings.priority_limit)
        .map(|(p, a)| PriorityItem {
            id: p.id.clone(),
            name: p.display_name(),
            score: a.score,
            band: Band::of(a.score),
            suggestions: a.findings.iter().map(|f| f.suggestion.clone()).collect(),
        })
        .collect();

    info!(
        "Quality of {} {}: average {:.1}",
        assessed.len(),
        collection,
        average_score
    );

    QualityReport {
        generated_at,
        collection,
        total: assessed.len(),
        average_score,
        distribution,
        field_completeness: completeness,
        common_issues,
        priority,
    }
}
