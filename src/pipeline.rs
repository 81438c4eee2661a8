use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cleaner::{self, CleanStats};
use crate::config::SourcesConfig;
use crate::fetcher;
use crate::links::{self, LinkReport, ProbeCache, ProbeSettings, Prober, RunCounts, Selection};
use crate::mapper;
use crate::merge::{self, MergeOptions, MergeReport};
use crate::model::Collection;
use crate::quality;
use crate::store;
use crate::validator;

/// Everything the full run needs besides the source configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub store_dir: PathBuf,
    pub work_dir: PathBuf,
    pub only_source: Option<String>,
    /// `None` skips link validation.
    pub links: Option<Selection>,
    pub check_images: bool,
    pub started_at: DateTime<Utc>,
    pub merge: MergeOptions,
}

impl RunOptions {
    pub fn store_path(&self, collection: Collection) -> PathBuf {
        self.store_dir.join(format!("{}.json", collection.key()))
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub fetched: usize,
    pub fetch_failures: usize,
    pub skipped: usize,
    pub mapped_pens: usize,
    pub mapped_inks: usize,
    pub needs_review: usize,
    pub cleaned: Vec<(Collection, CleanStats)>,
    pub accepted_pens: usize,
    pub accepted_inks: usize,
    pub rejected: usize,
    /// Average completeness score of the accepted records.
    pub quality: Vec<(Collection, f64)>,
    pub links: Vec<(Collection, RunCounts)>,
    pub merges: Vec<MergeReport>,
    pub cancelled: bool,
    /// The error that stopped the run, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<String>,
}

impl RunSummary {
    pub fn print(&self) {
        println!(
            "Fetch:     {} records, {} failures, {} skipped",
            self.fetched, self.fetch_failures, self.skipped
        );
        println!(
            "Map:       {} pens, {} inks ({} need review)",
            self.mapped_pens, self.mapped_inks, self.needs_review
        );
        for (collection, s) in &self.cleaned {
            println!(
                "Clean:     {}: {} -> {} ({} malformed, {} unnamed, {} duplicates, {} bad links, {} bad images)",
                collection,
                s.input,
                s.output,
                s.malformed,
                s.dropped_unnamed,
                s.duplicates,
                s.links_dropped,
                s.images_dropped
            );
        }
        println!(
            "Validate:  {} pens, {} inks accepted; {} rejected",
            self.accepted_pens, self.accepted_inks, self.rejected
        );
        for (collection, avg) in &self.quality {
            println!("Quality:   {}: average score {:.1}", collection, avg);
        }
        for (collection, c) in &self.links {
            println!(
                "Links:     {}: {} records, {} requests, {} short-circuited{}",
                collection,
                c.records_checked,
                c.requests,
                c.short_circuited,
                if c.cancelled { " (cancelled)" } else { "" }
            );
        }
        for m in &self.merges {
            println!("Merge:     {}", m.summary());
        }
        if self.cancelled {
            println!("Run was cancelled; results above are partial.");
        }
        if let Some(e) = &self.failed {
            println!("Run stopped early: {}", e);
        }
    }
}

fn write_stage<T: Serialize>(work_dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = work_dir.join(name);
    store::write_json_atomic(&path, value).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}

/// Fetch, map, clean, validate, optionally probe links, then merge each
/// collection into its store file. Each stage finishes before the next
/// starts and leaves its output in the work directory.
///
/// The summary is returned even when a stage fails, covering the work done
/// up to that point.
pub async fn run(config: &SourcesConfig, opts: &RunOptions, cancel: &CancellationToken) -> (RunSummary, Result<()>) {
    let mut summary = RunSummary::default();
    let outcome = run_stages(config, opts, cancel, &mut summary).await;
    summary.cancelled = cancel.is_cancelled();
    if let Err(e) = &outcome {
        summary.failed = Some(format!("{e:#}"));
    }
    (summary, outcome)
}

async fn run_stages(
    config: &SourcesConfig,
    opts: &RunOptions,
    cancel: &CancellationToken,
    summary: &mut RunSummary,
) -> Result<()> {
    let raw = fetcher::fetch_all(config, opts.only_source.as_deref(), cancel, opts.started_at).await?;
    summary.fetched = raw.records.len();
    summary.fetch_failures = raw.failures.len();
    summary.skipped = raw.skipped.len();
    write_stage(&opts.work_dir, "raw.json", &raw)?;

    let mapped = mapper::map_batch(&raw.records, &config.pipeline.price_bands, opts.started_at);
    summary.mapped_pens = mapped.pens.len();
    summary.mapped_inks = mapped.inks.len();
    summary.needs_review = mapped.needs_review.len();
    write_stage(&opts.work_dir, "mapped.json", &mapped)?;

    let (cleaned, stats) = cleaner::clean_batch(mapped, opts.merge.run_date);
    summary.cleaned = stats;
    write_stage(&opts.work_dir, "cleaned.json", &cleaned)?;

    let document = serde_json::to_value(&cleaned)?;
    let (mut accepted, report) = validator::validate_document(&document);
    accepted.generated_at = Some(opts.started_at);
    summary.accepted_pens = report.accepted_pens;
    summary.accepted_inks = report.accepted_inks;
    summary.rejected = report.rejected.len();
    write_stage(&opts.work_dir, "validated.json", &accepted)?;
    write_stage(&opts.work_dir, "validation-report.json", &report)?;

    for collection in Collection::ALL {
        let products = accepted.collection(collection);
        if products.is_empty() {
            continue;
        }
        let total: u32 = products
            .iter()
            .map(|p| quality::score(p, collection, &config.pipeline.quality) as u32)
            .sum();
        summary.quality.push((collection, total as f64 / products.len() as f64));
    }

    if let Some(selection) = opts.links {
        let settings = ProbeSettings::from_config(&config.pipeline.links, opts.check_images);
        let prober = Prober::new(&settings)?;
        let mut cache = ProbeCache::new();
        for collection in Collection::ALL {
            let products = accepted.collection_mut(collection);
            if products.is_empty() {
                continue;
            }
            let (counts, problems) = links::validate_links(
                products,
                selection,
                &prober,
                &settings,
                &mut cache,
                opts.merge.run_date,
                cancel,
            )
            .await;
            let (link_summary, details) = links::summarize(products);
            let report = LinkReport {
                generated_at: opts.started_at,
                collection,
                selection: selection.describe(),
                run: counts.clone(),
                summary: link_summary,
                problems,
                details,
            };
            write_stage(&opts.work_dir, &format!("link-report-{}.json", collection.key()), &report)?;
            summary.links.push((collection, counts));
        }
        write_stage(&opts.work_dir, "validated.json", &accepted)?;
    }

    let merges = &mut summary.merges;
    let merged = Collection::ALL.into_iter().try_for_each(|collection| {
        let incoming = accepted.collection(collection).to_vec();
        if incoming.is_empty() && !opts.merge.replace {
            info!("No incoming {}; leaving the store alone", collection);
            return Ok(());
        }
        let report = merge::reconcile(&opts.store_path(collection), collection, incoming, &opts.merge)
            .with_context(|| format!("Failed to merge {}", collection))?;
        info!("{}", report.summary());
        merges.push(report);
        Ok::<_, anyhow::Error>(())
    });
    // collections merged before a failure are already on disk
    write_stage(&opts.work_dir, "merge-report.json", &summary.merges)?;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
    }

    async fn shop() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixture("robots.txt")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/products/pilot-custom-823-amber"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fixture("product_page.html")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/products/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/products/pilot-custom-823-amber"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    fn config(base: &str) -> SourcesConfig {
        serde_json::from_value(json!({
            "globalSettings": { "defaultRateLimitMs": 0, "timeoutMs": 5000 },
            "pipeline": { "links": { "delayMs": 0, "timeoutSecs": 5 } },
            "sources": [{
                "id": "shop",
                "baseUrl": base,
                "robotsTxtUrl": format!("{base}/robots.txt"),
                "fieldMapping": {
                    "name": "h1.product-title",
                    "brand": ".product-brand",
                    "price": ".price",
                    "description": ".product-description"
                },
                "pages": ["/products/pilot-custom-823-amber", "/products/gone"]
            }]
        }))
        .unwrap()
    }

    fn options(dir: &Path, execute: bool, links: Option<Selection>) -> RunOptions {
        let run_date = NaiveDate::from_ymd_opt(2025, 4, 2).unwrap();
        RunOptions {
            store_dir: dir.join("data"),
            work_dir: dir.join("work"),
            only_source: None,
            links,
            check_images: false,
            started_at: DateTime::parse_from_rfc3339("2025-04-02T06:00:00Z").unwrap().with_timezone(&Utc),
            merge: MergeOptions {
                execute,
                backup: true,
                replace: false,
                backup_dir: dir.join("data/backups"),
                run_date,
                now: run_date.and_hms_opt(6, 0, 0).unwrap(),
            },
        }
    }

    #[tokio::test]
    async fn dry_run_writes_intermediates_but_not_the_store() {
        let server = shop().await;
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), false, None);

        let (summary, outcome) = run(&config(&server.uri()), &opts, &CancellationToken::new()).await;
        outcome.unwrap();

        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.fetch_failures, 1);
        assert_eq!(summary.accepted_pens, 1);
        assert_eq!(summary.merges.len(), 1);
        assert_eq!(summary.merges[0].added_count, 1);
        assert!(summary.merges[0].dry_run);
        assert!(!opts.store_path(Collection::Pens).exists());
        for name in ["raw.json", "mapped.json", "cleaned.json", "validated.json", "merge-report.json"] {
            assert!(opts.work_dir.join(name).exists(), "{name} missing");
        }
    }

    #[tokio::test]
    async fn execute_with_links_lands_in_the_store() {
        let server = shop().await;
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), true, Some(Selection::All));

        let (summary, outcome) = run(&config(&server.uri()), &opts, &CancellationToken::new()).await;
        outcome.unwrap();
        assert_eq!(summary.links.len(), 1);
        assert_eq!(summary.links[0].1.requests, 1);

        let doc = store::CatalogDocument::load(&opts.store_path(Collection::Pens), Collection::Pens).unwrap();
        assert_eq!(doc.products.len(), 1);
        let pen = &doc.products[0];
        assert_eq!(pen.id, "pilot-custom-823-amber");
        assert_eq!(pen.sources, vec!["shop"]);
        let link = &pen.links()[0];
        assert_eq!(link.valid, Some(true));
        assert_eq!(link.last_validated, Some(opts.merge.run_date));
        assert!(opts.work_dir.join("link-report-pens.json").exists());
        assert!(!opts.store_path(Collection::Inks).exists());
    }

    #[tokio::test]
    async fn failed_merge_still_reports_what_landed() {
        let server = shop().await;
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path(), true, None);
        opts.merge.replace = true;
        std::fs::create_dir_all(&opts.store_dir).unwrap();
        std::fs::write(opts.store_path(Collection::Inks), "{ not json").unwrap();

        let (summary, outcome) = run(&config(&server.uri()), &opts, &CancellationToken::new()).await;

        let err = outcome.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to merge inks"));
        assert_eq!(summary.merges.len(), 1);
        assert_eq!(summary.merges[0].collection, Collection::Pens);
        assert!(summary.failed.is_some());
        assert!(opts.store_path(Collection::Pens).exists());

        let written: serde_json::Value = store::read_json(&opts.work_dir.join("merge-report.json")).unwrap();
        assert_eq!(written.as_array().unwrap().len(), 1);
    }
}
