pub mod api;
pub mod extract;
pub mod robots;
pub mod sitemap;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, SourcesConfig};
use crate::error::FetchError;
use crate::model::RawRecord;
use extract::FieldMapping;
use robots::RobotsPolicy;

/// Fetch settings for one source, resolved against the global settings.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub base_url: String,
    pub robots_txt_url: Option<String>,
    pub field_mapping: FieldMapping,
    pub rate_limit: Duration,
    pub user_agent: String,
    pub max_concurrency: usize,
    pub timeout: Duration,
}

/// A page that could not be turned into a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailure {
    pub source_id: String,
    pub url: String,
    pub class: String,
    pub message: String,
}

impl FetchFailure {
    pub fn new(source_id: &str, url: &str, err: &FetchError) -> Self {
        Self {
            source_id: source_id.to_string(),
            url: url.to_string(),
            class: err.class().to_string(),
            message: err.to_string(),
        }
    }
}

/// A page deliberately not requested (robots.txt, cancellation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPage {
    pub source_id: String,
    pub url: String,
    pub reason: String,
}

/// Output document of the fetch stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBatch {
    pub generated_at: DateTime<Utc>,
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub failures: Vec<FetchFailure>,
    #[serde(default)]
    pub skipped: Vec<SkippedPage>,
}

impl RawBatch {
    pub fn new(generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            records: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn absorb(&mut self, other: SourceFetch) {
        self.records.extend(other.records);
        self.failures.extend(other.failures);
        self.skipped.extend(other.skipped);
    }
}

/// Per-source result, records in the order their URLs were given.
#[derive(Debug, Default)]
pub struct SourceFetch {
    pub records: Vec<RawRecord>,
    pub failures: Vec<FetchFailure>,
    pub skipped: Vec<SkippedPage>,
}

enum PageOutcome {
    Fetched(RawRecord),
    Failed(FetchError),
    Cancelled,
}

pub fn build_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .context("Failed to build HTTP client")
}

/// Fetch every enabled source in the configuration, one source at a time.
pub async fn fetch_all(
    config: &SourcesConfig,
    only: Option<&str>,
    cancel: &CancellationToken,
    fetched_at: DateTime<Utc>,
) -> Result<RawBatch> {
    let mut batch = RawBatch::new(fetched_at);

    for source in &config.sources {
        if only.is_some_and(|id| id != source.id) {
            continue;
        }
        if !source.enabled {
            info!("Skipping disabled source {}", source.id);
            continue;
        }
        if cancel.is_cancelled() {
            warn!("Run cancelled; not starting source {}", source.id);
            break;
        }
        info!("Fetching source {} ({})", source.display_name(), source.base_url);
        let result = fetch_source(config, source, cancel, fetched_at).await?;
        info!(
            "{}: {} records, {} failures, {} skipped",
            source.id,
            result.records.len(),
            result.failures.len(),
            result.skipped.len()
        );
        batch.absorb(result);
    }

    Ok(batch)
}

/// Fetch one source: robots policy once, page discovery, the page pool, then
/// the API if configured.
pub async fn fetch_source(
    config: &SourcesConfig,
    source: &SourceConfig,
    cancel: &CancellationToken,
    fetched_at: DateTime<Utc>,
) -> Result<SourceFetch> {
    let descriptor = source.descriptor(&config.global_settings);
    let client = build_client(&descriptor.user_agent, descriptor.timeout)?;

    let robots = match &descriptor.robots_txt_url {
        Some(url) if !cancel.is_cancelled() => robots::load(&client, url).await,
        _ => RobotsPolicy::allow_all(),
    };

    let (urls, mut discovery_failures) = discover_pages(&client, source, &descriptor, &robots, cancel).await;
    let mut result = if urls.is_empty() {
        SourceFetch::default()
    } else {
        fetch_pages(&client, &descriptor, urls, &robots, cancel, fetched_at).await
    };
    result.failures.append(&mut discovery_failures);

    if source.has_api {
        if let Some(api_config) = &source.api {
            let (records, failures) =
                api::fetch_api(&client, &source.id, api_config, cancel, fetched_at).await;
            result.records.extend(records);
            result.failures.extend(failures);
        } else {
            warn!("{} declares hasApi but has no api section", source.id);
        }
    }

    Ok(result)
}

/// Product page URLs for a source: explicit pages, then links found on
/// category pages, then sitemap entries matching the product pattern.
/// Nothing more is requested once `cancel` fires; what was found so far is
/// returned.
pub async fn discover_pages(
    client: &reqwest::Client,
    source: &SourceConfig,
    descriptor: &SourceDescriptor,
    robots: &RobotsPolicy,
    cancel: &CancellationToken,
) -> (Vec<String>, Vec<FetchFailure>) {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    let mut failures = Vec::new();

    let mut push = |u: String| {
        if seen.insert(u.clone()) {
            urls.push(u);
        }
    };

    for page in &source.pages {
        if let Some(abs) = crate::text::resolve_url(&source.base_url, page) {
            push(abs);
        }
    }

    for category in &source.category_pages {
        if cancel.is_cancelled() {
            info!("{}: cancelled; skipping remaining category pages", source.id);
            break;
        }
        let Some(category_url) = crate::text::resolve_url(&source.base_url, category) else {
            continue;
        };
        if !robots.is_allowed(&category_url, &descriptor.user_agent) {
            info!("robots.txt disallows category page {}", category_url);
            continue;
        }
        match fetch_links(client, &category_url, &source.product_link_selectors, &source.base_url).await {
            Ok(links) => {
                info!("{}: {} product links on {}", source.id, links.len(), category_url);
                links.into_iter().for_each(&mut push);
            }
            Err(e) => {
                warn!("{}: category page {} failed: {}", source.id, category_url, e);
                failures.push(FetchFailure::new(&source.id, &category_url, &e));
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(descriptor.rate_limit) => {}
            _ = cancel.cancelled() => {}
        }
    }

    if let Some(sitemap_url) = source.sitemap_url.as_ref().filter(|_| !cancel.is_cancelled()) {
        let pattern = match source.product_url_pattern.as_deref().map(Regex::new).transpose() {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: invalid productUrlPattern: {}", source.id, e);
                failures.push(FetchFailure::new(
                    &source.id,
                    sitemap_url,
                    &FetchError::Parse(e.to_string()),
                ));
                return (urls, failures);
            }
        };
        match sitemap::fetch_product_urls(client, sitemap_url, pattern.as_ref(), cancel).await {
            Ok(found) => found.into_iter().for_each(&mut push),
            Err(e) => {
                warn!("{}: sitemap {} failed: {:#}", source.id, sitemap_url, e);
                failures.push(FetchFailure::new(
                    &source.id,
                    sitemap_url,
                    &FetchError::Network(format!("{e:#}")),
                ));
            }
        }
    }

    (urls, failures)
}

async fn fetch_links(
    client: &reqwest::Client,
    url: &str,
    selectors: &[String],
    base_url: &str,
) -> Result<Vec<String>, FetchError> {
    let body = get_html(client, url).await?;
    let document = Html::parse_document(&body);
    extract::extract_links(&document, selectors, base_url)
}

async fn get_html(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    debug!("GET {}", url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::from_reqwest(&e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    response.text().await.map_err(|e| FetchError::from_reqwest(&e))
}

/// Fetch and extract one product page.
pub async fn fetch_page(
    client: &reqwest::Client,
    source: &SourceDescriptor,
    url: &str,
    fetched_at: DateTime<Utc>,
) -> Result<RawRecord, FetchError> {
    let body = get_html(client, url).await?;
    let mut fields = {
        let document = Html::parse_document(&body);
        extract::extract(&document, &source.field_mapping, &source.base_url)?
    };
    if fields.is_empty() {
        return Err(FetchError::Parse("no mapped fields matched".into()));
    }

    let canonical = match fields.remove("url") {
        Some(Value::String(u)) => u,
        _ => url.to_string(),
    };
    let mut record = RawRecord::new(source.id.clone(), Some(canonical), fetched_at);
    record.fields = fields;
    Ok(record)
}

/// Fetch pages through a pool of `max_concurrency` workers. Each worker sleeps
/// the source's rate limit after a successful fetch while still holding its
/// slot. Disallowed URLs are never requested; after cancellation no new
/// request is issued.
pub async fn fetch_pages(
    client: &reqwest::Client,
    source: &SourceDescriptor,
    urls: Vec<String>,
    robots: &RobotsPolicy,
    cancel: &CancellationToken,
    fetched_at: DateTime<Utc>,
) -> SourceFetch {
    let semaphore = Arc::new(Semaphore::new(source.max_concurrency.max(1)));
    let shared = Arc::new(source.clone());
    let total = urls.len();

    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_message(source.id.clone());

    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<(usize, String, PageOutcome)>(source.max_concurrency.max(1) * 2);

    let mut result = SourceFetch::default();

    for (idx, url) in urls.into_iter().enumerate() {
        if !robots.is_allowed(&url, &source.user_agent) {
            info!("robots.txt disallows {}", url);
            result.skipped.push(SkippedPage {
                source_id: source.id.clone(),
                url,
                reason: FetchError::Disallowed.class().to_string(),
            });
            pb.inc(1);
            continue;
        }

        let client = client.clone();
        let sem = Arc::clone(&semaphore);
        let source = Arc::clone(&shared);
        let cancel = cancel.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            if cancel.is_cancelled() {
                let _ = tx.send((idx, url, PageOutcome::Cancelled)).await;
                return;
            }
            let outcome = match fetch_page(&client, &source, &url, fetched_at).await {
                Ok(record) => PageOutcome::Fetched(record),
                Err(e) => PageOutcome::Failed(e),
            };
            let fetched = matches!(outcome, PageOutcome::Fetched(_));
            let _ = tx.send((idx, url, outcome)).await;
            if fetched {
                tokio::select! {
                    _ = tokio::time::sleep(source.rate_limit) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        });
    }

    // rx closes once every spawned worker has dropped its sender
    drop(tx);

    let mut fetched: Vec<(usize, RawRecord)> = Vec::new();
    while let Some((idx, url, outcome)) = rx.recv().await {
        match outcome {
            PageOutcome::Fetched(record) => fetched.push((idx, record)),
            PageOutcome::Failed(e) => {
                warn!("{}: {} failed: {}", source.id, url, e);
                result.failures.push(FetchFailure::new(&source.id, &url, &e));
            }
            PageOutcome::Cancelled => result.skipped.push(SkippedPage {
                source_id: source.id.clone(),
                url,
                reason: FetchError::Cancelled.class().to_string(),
            }),
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    fetched.sort_by_key(|(idx, _)| *idx);
    result.records = fetched.into_iter().map(|(_, r)| r).collect();
    result.failures.sort_by(|a, b| a.url.cmp(&b.url));

    info!(
        "{}: fetched {} of {} pages ({} failed, {} skipped)",
        source.id,
        result.records.len(),
        total,
        result.failures.len(),
        result.skipped.len()
    );
    result
}
