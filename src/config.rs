use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::fetcher::api::ApiConfig;
use crate::fetcher::SourceDescriptor;

const DEFAULT_USER_AGENT: &str = "pen_catalog/0.1 (+catalog maintenance; batch, low volume)";

/// Source configuration document (`config/data-sources.json`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesConfig {
    #[serde(default)]
    pub global_settings: GlobalSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub user_agent: String,
    pub respect_robots_txt: bool,
    pub timeout_ms: u64,
    pub default_rate_limit_ms: u64,
    pub max_concurrent_requests: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            respect_robots_txt: true,
            timeout_ms: 30_000,
            default_rate_limit_ms: 2_000,
            max_concurrent_requests: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub robots_txt_url: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Target field → CSS selector.
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Product pages fetched directly.
    #[serde(default)]
    pub pages: Vec<String>,
    /// Listing pages whose product links are discovered and fetched.
    #[serde(default)]
    pub category_pages: Vec<String>,
    #[serde(default)]
    pub product_link_selectors: Vec<String>,
    #[serde(default)]
    pub sitemap_url: Option<String>,
    #[serde(default)]
    pub product_url_pattern: Option<String>,
    #[serde(default)]
    pub has_api: bool,
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Resolve per-source overrides against the global settings.
    pub fn descriptor(&self, global: &GlobalSettings) -> SourceDescriptor {
        SourceDescriptor {
            id: self.id.clone(),
            base_url: self.base_url.clone(),
            robots_txt_url: if global.respect_robots_txt {
                self.robots_txt_url.clone()
            } else {
                None
            },
            field_mapping: self.field_mapping.clone(),
            rate_limit: Duration::from_millis(
                self.rate_limit_ms.unwrap_or(global.default_rate_limit_ms),
            ),
            user_agent: self
                .user_agent
                .clone()
                .unwrap_or_else(|| global.user_agent.clone()),
            max_concurrency: self
                .max_concurrency
                .unwrap_or(global.max_concurrent_requests)
                .max(1),
            timeout: Duration::from_millis(global.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub price_bands: PriceBands,
    pub links: LinkSettings,
    pub quality: QualitySettings,
}

/// Advisory price tags applied by the mapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceBands {
    pub entry_level_below: f64,
    pub mid_range_below: f64,
}

impl Default for PriceBands {
    fn default() -> Self {
        Self {
            entry_level_below: 50.0,
            mid_range_below: 200.0,
        }
    }
}

impl PriceBands {
    pub fn tag_for(&self, price: f64) -> &'static str {
        if price < self.entry_level_below {
            "entry-level"
        } else if price < self.mid_range_below {
            "mid-range"
        } else {
            "luxury"
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkSettings {
    pub timeout_secs: u64,
    pub max_redirects: usize,
    pub delay_ms: u64,
    pub concurrency: usize,
    pub priority_limit: usize,
    pub user_agent: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_redirects: 5,
            delay_ms: 500,
            concurrency: 1,
            priority_limit: 30,
            user_agent: "Mozilla/5.0 (compatible; pen_catalog-link-check/0.1)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualitySettings {
    pub priority_limit: usize,
    pub min_description_length: usize,
    pub min_details_length: usize,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            priority_limit: 30,
            min_description_length: 50,
            min_details_length: 100,
        }
    }
}

pub fn load(path: &Path) -> Result<SourcesConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source config {}", path.display()))?;
    let config: SourcesConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid source config {}", path.display()))?;
    Ok(config)
}

/// Pipeline settings from an optional config file, defaults otherwise.
pub fn load_pipeline_settings(path: Option<&Path>) -> Result<PipelineSettings> {
    match path {
        Some(p) => Ok(load(p)?.pipeline),
        None => Ok(PipelineSettings::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "globalSettings": { "userAgent": "test-agent/1.0", "defaultRateLimitMs": 1500 },
        "pipeline": { "priceBands": { "entryLevelBelow": 40 } },
        "sources": [
            {
                "id": "goulet",
                "name": "Goulet Pens",
                "baseUrl": "https://www.gouletpens.com",
                "robotsTxtUrl": "https://www.gouletpens.com/robots.txt",
                "fieldMapping": { "name": "h1.product-title", "price": ".price" },
                "maxConcurrency": 1,
                "pages": ["https://www.gouletpens.com/products/a"]
            },
            {
                "id": "wikipedia",
                "baseUrl": "https://www.wikidata.org",
                "hasApi": true,
                "enabled": false
            }
        ]
    }"#;

    #[test]
    fn parses_sources_with_defaults() {
        let config: SourcesConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.sources.len(), 2);
        assert!(config.global_settings.respect_robots_txt);
        assert_eq!(config.global_settings.max_concurrent_requests, 2);
        assert_eq!(config.pipeline.price_bands.entry_level_below, 40.0);
        assert_eq!(config.pipeline.price_bands.mid_range_below, 200.0);
        assert_eq!(config.pipeline.links.max_redirects, 5);
        assert!(!config.sources[1].enabled);
        assert!(config.sources[1].has_api);
    }

    #[test]
    fn descriptor_resolves_overrides() {
        let config: SourcesConfig = serde_json::from_str(SAMPLE).unwrap();
        let d = config.sources[0].descriptor(&config.global_settings);
        assert_eq!(d.id, "goulet");
        assert_eq!(d.user_agent, "test-agent/1.0");
        assert_eq!(d.rate_limit, Duration::from_millis(1500));
        assert_eq!(d.max_concurrency, 1);
        assert!(d.robots_txt_url.is_some());
        assert_eq!(d.field_mapping["price"], ".price");
    }

    #[test]
    fn robots_can_be_disabled_globally() {
        let mut config: SourcesConfig = serde_json::from_str(SAMPLE).unwrap();
        config.global_settings.respect_robots_txt = false;
        let d = config.sources[0].descriptor(&config.global_settings);
        assert!(d.robots_txt_url.is_none());
    }

    #[test]
    fn price_band_tags() {
        let bands = PriceBands::default();
        assert_eq!(bands.tag_for(25.0), "entry-level");
        assert_eq!(bands.tag_for(50.0), "mid-range");
        assert_eq!(bands.tag_for(650.0), "luxury");
    }
}
