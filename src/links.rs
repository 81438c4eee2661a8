use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LinkSettings;
use crate::model::{CanonicalProduct, Collection, LinkStatus, StatusLabel, ValidationResult};
use crate::text::{host_of, is_valid_url};

const PLACEHOLDER_HOSTS: &[&str] = &["example.com", "example.org", "example.net", "dummyimage.com"];

/// Known stand-in URLs that never point at a real retailer or image.
pub fn is_placeholder(url: &str) -> bool {
    if url.to_lowercase().contains("placeholder") {
        return true;
    }
    match host_of(url) {
        Some(host) => PLACEHOLDER_HOSTS
            .iter()
            .any(|p| host == *p || host.ends_with(&format!(".{p}"))),
        None => false,
    }
}

/// Verdict reachable without a request: malformed or placeholder URLs.
pub fn precheck(url: &str) -> Option<ValidationResult> {
    if url.trim().is_empty() || !is_valid_url(url) {
        return Some(ValidationResult::failed(
            LinkStatus::Label(StatusLabel::Invalid),
            "malformed URL",
        ));
    }
    if is_placeholder(url) {
        return Some(ValidationResult::failed(
            LinkStatus::Label(StatusLabel::Placeholder),
            "placeholder URL",
        ));
    }
    None
}

/// Which records a bounded run validates. Records outside the selection keep
/// their previous link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    All,
    /// The first `n` records in store order.
    Prefix(usize),
    /// The `n` records whose links were validated longest ago (never first).
    Stalest(usize),
    /// The `n` records with the fewest links, i.e. cheapest to check.
    FewestLinks(usize),
}

impl Selection {
    /// Indices of the selected records, in store order.
    pub fn pick(&self, products: &[CanonicalProduct]) -> Vec<usize> {
        let mut picked: Vec<usize> = match *self {
            Selection::All => return (0..products.len()).collect(),
            Selection::Prefix(n) => return (0..products.len().min(n)).collect(),
            Selection::Stalest(n) => {
                let mut idx: Vec<usize> = (0..products.len())
                    .filter(|&i| !products[i].links().is_empty())
                    .collect();
                idx.sort_by_key(|&i| {
                    products[i]
                        .links()
                        .iter()
                        .map(|l| l.last_validated)
                        .min()
                        .flatten()
                });
                idx.truncate(n);
                idx
            }
            Selection::FewestLinks(n) => {
                let mut idx: Vec<usize> = (0..products.len())
                    .filter(|&i| !products[i].links().is_empty())
                    .collect();
                idx.sort_by_key(|&i| products[i].links().len());
                idx.truncate(n);
                idx
            }
        };
        picked.sort_unstable();
        picked
    }

    pub fn describe(&self) -> String {
        match self {
            Selection::All => "all".to_string(),
            Selection::Prefix(n) => format!("first {n}"),
            Selection::Stalest(n) => format!("{n} stalest"),
            Selection::FewestLinks(n) => format!("{n} with fewest links"),
        }
    }
}

/// Results of this run, keyed by URL and whether an image was expected.
/// Scoped to one run and passed in explicitly.
#[derive(Debug, Default)]
pub struct ProbeCache {
    entries: HashMap<(String, bool), ValidationResult>,
}

impl ProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str, image: bool) -> Option<&ValidationResult> {
        self.entries.get(&(url.to_string(), image))
    }

    pub fn insert(&mut self, url: String, image: bool, result: ValidationResult) {
        self.entries.insert((url, image), result);
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub max_redirects: usize,
    pub delay: Duration,
    pub concurrency: usize,
    pub user_agent: String,
    pub check_images: bool,
}

impl ProbeSettings {
    pub fn from_config(links: &LinkSettings, check_images: bool) -> Self {
        Self {
            timeout: Duration::from_secs(links.timeout_secs),
            max_redirects: links.max_redirects,
            delay: Duration::from_millis(links.delay_ms),
            concurrency: links.concurrency.max(1),
            user_agent: links.user_agent.clone(),
            check_images,
        }
    }
}

/// Header-only reachability probe.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    pub fn new(settings: &ProbeSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&settings.user_agent)
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects))
            .build()
            .context("Failed to build link-check client")?;
        Ok(Self { client })
    }

    pub async fn probe(&self, url: &str, image: bool) -> ValidationResult {
        if let Some(r) = precheck(url) {
            return r;
        }
        debug!("HEAD {}", url);
        match self.client.head(url).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                if !(200..400).contains(&code) {
                    return ValidationResult::failed(LinkStatus::Code(code), format!("HTTP {code}"));
                }
                if image {
                    let content_type = response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_lowercase();
                    if !content_type.starts_with("image/") {
                        let shown = if content_type.is_empty() { "none" } else { &content_type };
                        return ValidationResult::failed(
                            LinkStatus::Code(code),
                            format!("content type {shown} is not an image"),
                        );
                    }
                }
                ValidationResult::ok(code)
            }
            Err(e) if e.is_redirect() => ValidationResult::failed(
                LinkStatus::Label(StatusLabel::Timeout),
                "no final response: too many redirects",
            ),
            Err(e) if e.is_builder() => {
                ValidationResult::failed(LinkStatus::Label(StatusLabel::Invalid), e.to_string())
            }
            Err(e) => ValidationResult::failed(
                LinkStatus::Label(StatusLabel::Timeout),
                format!("no response: {e}"),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Target {
    Link(usize),
    MainImage,
    Gallery,
}

#[derive(Debug, Clone)]
struct Job {
    record: usize,
    target: Target,
    url: String,
}

impl Job {
    fn is_image(&self) -> bool {
        !matches!(self.target, Target::Link(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub records_checked: usize,
    pub requests: usize,
    pub short_circuited: usize,
    pub cache_hits: usize,
    pub not_reached: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkProblem {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub image: bool,
    pub status: LinkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probe the links (and optionally images) of the selected records and
/// annotate each probed link with `valid`, `status` and `lastValidated`.
///
/// Distinct URLs are requested once; placeholders and malformed URLs never
/// reach the network. After cancellation no new request is made and links
/// not yet reached keep their previous state.
pub async fn validate_links(
    products: &mut [CanonicalProduct],
    selection: Selection,
    prober: &Prober,
    settings: &ProbeSettings,
    cache: &mut ProbeCache,
    run_date: NaiveDate,
    cancel: &CancellationToken,
) -> (RunCounts, Vec<LinkProblem>) {
    let picked = selection.pick(products);
    let mut counts = RunCounts {
        records_checked: picked.len(),
        ..Default::default()
    };

    let mut jobs = Vec::new();
    for &i in &picked {
        let p = &products[i];
        for (j, link) in p.links().iter().enumerate() {
            jobs.push(Job {
                record: i,
                target: Target::Link(j),
                url: link.url.clone(),
            });
        }
        if settings.check_images {
            if let Some(images) = &p.images {
                if let Some(main) = &images.main {
                    jobs.push(Job {
                        record: i,
                        target: Target::MainImage,
                        url: main.clone(),
                    });
                }
                for url in &images.gallery {
                    jobs.push(Job {
                        record: i,
                        target: Target::Gallery,
                        url: url.clone(),
                    });
                }
            }
        }
    }

    // Unique targets that need the network.
    let mut pending: Vec<(String, bool)> = Vec::new();
    for job in &jobs {
        let key = (job.url.clone(), job.is_image());
        if cache.get(&key.0, key.1).is_some() || pending.contains(&key) {
            continue;
        }
        if let Some(r) = precheck(&job.url) {
            cache.insert(key.0, key.1, r);
            continue;
        }
        pending.push(key);
    }
    counts.short_circuited = jobs.iter().filter(|j| precheck(&j.url).is_some()).count();

    info!(
        "Checking {} records: {} links/images, {} distinct URLs to request",
        picked.len(),
        jobs.len(),
        pending.len()
    );

    let probed = if settings.concurrency <= 1 {
        probe_sequential(prober, pending, settings.delay, cancel).await
    } else {
        probe_pooled(prober, pending, settings, cancel).await
    };
    counts.requests = probed.len();
    counts.cancelled = cancel.is_cancelled();
    for ((url, image), result) in probed {
        cache.insert(url, image, result);
    }

    let mut problems = Vec::new();
    let mut applied = std::collections::HashSet::new();
    for job in &jobs {
        let Some(result) = cache.get(&job.url, job.is_image()).cloned() else {
            counts.not_reached += 1;
            continue;
        };
        if !applied.insert((job.url.clone(), job.is_image())) {
            counts.cache_hits += 1;
        }
        let product = &mut products[job.record];
        if let Target::Link(j) = job.target {
            if let Some(link) = product.purchase_links.as_mut().and_then(|l| l.get_mut(j)) {
                link.valid = Some(result.valid);
                link.status = Some(result.status);
                link.last_validated = Some(run_date);
            }
        }
        if !result.valid {
            problems.push(LinkProblem {
                id: product.id.clone(),
                url: job.url.clone(),
                image: job.is_image(),
                status: result.status,
                error: result.error.clone(),
            });
        }
    }

    if counts.not_reached > 0 {
        warn!("{} links/images not checked before cancellation", counts.not_reached);
    }
    (counts, problems)
}

fn progress(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

async fn probe_sequential(
    prober: &Prober,
    pending: Vec<(String, bool)>,
    delay: Duration,
    cancel: &CancellationToken,
) -> Vec<((String, bool), ValidationResult)> {
    let pb = progress(pending.len());
    let mut out = Vec::with_capacity(pending.len());
    let last = pending.len().saturating_sub(1);

    for (i, (url, image)) in pending.into_iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let result = prober.probe(&url, image).await;
        debug!("{} -> {}", url, result.status);
        out.push(((url, image), result));
        pb.inc(1);
        if i < last {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
    pb.finish_and_clear();
    out
}

async fn probe_pooled(
    prober: &Prober,
    pending: Vec<(String, bool)>,
    settings: &ProbeSettings,
    cancel: &CancellationToken,
) -> Vec<((String, bool), ValidationResult)> {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let pb = progress(pending.len());
    let (tx, mut rx) =
        tokio::sync::mpsc::channel::<((String, bool), ValidationResult)>(settings.concurrency * 2);

    for (url, image) in pending {
        let prober = prober.clone();
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();
        let cancel = cancel.clone();
        let delay = settings.delay;

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            let result = prober.probe(&url, image).await;
            let _ = tx.send(((url, image), result)).await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        });
    }
    drop(tx);

    let mut out = Vec::new();
    while let Some(item) = rx.recv().await {
        out.push(item);
        pb.inc(1);
    }
    pb.finish_and_clear();
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSummary {
    pub total_records: usize,
    pub records_with_links: usize,
    pub records_without_links: usize,
    pub total_links: usize,
    pub valid_links: usize,
    pub invalid_links: usize,
    pub unchecked_links: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordLinks {
    pub id: String,
    pub name: String,
    pub link_count: usize,
    pub valid_links: usize,
    pub invalid_links: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    pub generated_at: DateTime<Utc>,
    pub collection: Collection,
    pub selection: String,
    pub run: RunCounts,
    pub summary: LinkSummary,
    pub problems: Vec<LinkProblem>,
    pub details: Vec<RecordLinks>,
}

/// Link state of a whole collection, as currently annotated.
pub fn summarize(products: &[CanonicalProduct]) -> (LinkSummary, Vec<RecordLinks>) {
    let mut summary = LinkSummary {
        total_records: products.len(),
        ..Default::default()
    };
    let mut details = Vec::with_capacity(products.len());

    for p in products {
        let links = p.links();
        if links.is_empty() {
            summary.records_without_links += 1;
        } else {
            summary.records_with_links += 1;
        }
        let valid = links.iter().filter(|l| l.valid == Some(true)).count();
        let invalid = links.iter().filter(|l| l.valid == Some(false)).count();
        summary.total_links += links.len();
        summary.valid_links += valid;
        summary.invalid_links += invalid;
        summary.unchecked_links += links.len() - valid - invalid;
        details.push(RecordLinks {
            id: p.id.clone(),
            name: p.display_name(),
            link_count: links.len(),
            valid_links: valid,
            invalid_links: invalid,
        });
    }
    (summary, details)
}
