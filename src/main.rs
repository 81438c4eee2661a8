mod cleaner;
mod config;
mod error;
mod fetcher;
mod incremental;
mod links;
mod mapper;
mod merge;
mod model;
mod pipeline;
mod quality;
mod store;
mod text;
mod validator;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineSettings;
use crate::fetcher::RawBatch;
use crate::links::{LinkReport, ProbeCache, ProbeSettings, Prober, Selection};
use crate::mapper::ProductBatch;
use crate::merge::MergeOptions;
use crate::model::Collection;
use crate::store::CatalogDocument;

#[derive(Parser)]
#[command(name = "pen_catalog", about = "Fountain pen and ink catalog pipeline")]
struct Cli {
    /// Source configuration document
    #[arg(long, global = true, default_value = "config/data-sources.json")]
    config: PathBuf,
    /// Run date stamped into records (default: today, UTC)
    #[arg(long, global = true)]
    date: Option<NaiveDate>,
    /// Stop issuing new requests after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct WriteArgs {
    /// Write to the store (default is a dry run)
    #[arg(long, conflicts_with = "dry_run")]
    execute: bool,
    /// Only report what would change
    #[arg(long)]
    dry_run: bool,
    /// Skip the timestamped backup before writing
    #[arg(long)]
    no_backup: bool,
    /// Backup directory (default: <store dir>/backups)
    #[arg(long)]
    backup_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SelectBy {
    Prefix,
    Stalest,
    FewestLinks,
}

#[derive(Args, Clone)]
struct SelectArgs {
    /// Validate every record
    #[arg(long, conflicts_with = "priority_only")]
    all: bool,
    /// Validate a bounded subset (the default)
    #[arg(long)]
    priority_only: bool,
    /// How the bounded subset is chosen
    #[arg(long, value_enum, default_value = "stalest")]
    select: SelectBy,
    /// Subset size (default: pipeline.links.priorityLimit)
    #[arg(short = 'n', long)]
    limit: Option<usize>,
}

impl SelectArgs {
    fn selection(&self, default_limit: usize) -> Selection {
        if self.all {
            return Selection::All;
        }
        let n = self.limit.unwrap_or(default_limit);
        match self.select {
            SelectBy::Prefix => Selection::Prefix(n),
            SelectBy::Stalest => Selection::Stalest(n),
            SelectBy::FewestLinks => Selection::FewestLinks(n),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch raw records from the configured sources
    Fetch {
        /// Raw batch output
        #[arg(default_value = "work/raw.json")]
        output: PathBuf,
        /// Only this source id
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Map raw records into canonical pens and inks
    Map {
        #[arg(default_value = "work/raw.json")]
        input: PathBuf,
        #[arg(default_value = "work/mapped.json")]
        output: PathBuf,
    },
    /// Backfill, normalize and deduplicate a mapped batch
    Clean {
        #[arg(default_value = "work/mapped.json")]
        input: PathBuf,
        #[arg(default_value = "work/cleaned.json")]
        output: PathBuf,
    },
    /// Schema-check a batch; only accepted records are written
    Validate {
        #[arg(default_value = "work/cleaned.json")]
        input: PathBuf,
        #[arg(default_value = "work/validated.json")]
        output: PathBuf,
        #[arg(long, default_value = "reports/validation-report.json")]
        report: PathBuf,
    },
    /// Probe purchase links of a store file
    Links {
        /// Store file (pens.json or inks.json)
        input: PathBuf,
        /// Where to write the annotated store (default: in place)
        output: Option<PathBuf>,
        #[arg(short, long, value_enum)]
        collection: Option<Collection>,
        #[command(flatten)]
        select: SelectArgs,
        /// Also check image URLs
        #[arg(long)]
        images: bool,
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Merge a validated batch into the store files
    Merge {
        #[arg(default_value = "work/validated.json")]
        input: PathBuf,
        #[arg(default_value = "data")]
        store_dir: PathBuf,
        /// Replace store contents with the batch instead of merging
        #[arg(long)]
        no_merge: bool,
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Merge only records newer than the store
    Update {
        #[arg(default_value = "work/validated.json")]
        input: PathBuf,
        #[arg(default_value = "data")]
        store_dir: PathBuf,
        #[arg(long, default_value = "reports")]
        report_dir: PathBuf,
        #[command(flatten)]
        write: WriteArgs,
    },
    /// Score completeness of a store file
    Quality {
        input: PathBuf,
        #[arg(short, long, value_enum)]
        collection: Option<Collection>,
        #[arg(long)]
        report: Option<PathBuf>,
        /// Rows of the priority list to print
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Fetch, map, clean, validate, check links and merge in one go
    Run {
        /// Store directory holding pens.json and inks.json
        #[arg(default_value = "data")]
        store_dir: PathBuf,
        #[arg(long, default_value = "work")]
        work_dir: PathBuf,
        #[arg(short, long)]
        source: Option<String>,
        /// Probe purchase links before merging
        #[arg(long)]
        links: bool,
        #[command(flatten)]
        select: SelectArgs,
        #[arg(long)]
        images: bool,
        /// Replace store contents with the batch instead of merging
        #[arg(long)]
        no_merge: bool,
        #[command(flatten)]
        write: WriteArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let started_at = Utc::now();
    let run_date = cli.date.unwrap_or_else(|| started_at.date_naive());
    let cancel = cancellation(cli.timeout);

    let result = match cli.command {
        Commands::Fetch { output, source } => {
            let config = config::load(&cli.config)?;
            let batch = fetcher::fetch_all(&config, source.as_deref(), &cancel, started_at).await?;
            store::write_json_atomic(&output, &batch)?;
            println!(
                "Fetched {} records ({} failures, {} skipped) -> {}",
                batch.records.len(),
                batch.failures.len(),
                batch.skipped.len(),
                output.display()
            );
            Ok(())
        }
        Commands::Map { input, output } => {
            let settings = pipeline_settings(&cli.config)?;
            let raw: RawBatch = store::read_json(&input)?;
            let batch = mapper::map_batch(&raw.records, &settings.price_bands, started_at);
            store::write_json_atomic(&output, &batch)?;
            println!(
                "Mapped {} records: {} pens, {} inks ({} need review) -> {}",
                raw.records.len(),
                batch.pens.len(),
                batch.inks.len(),
                batch.needs_review.len(),
                output.display()
            );
            for item in &batch.needs_review {
                println!("  review: {} ({}) {}", item.id, item.source_id, item.url.as_deref().unwrap_or("-"));
            }
            Ok(())
        }
        Commands::Clean { input, output } => {
            let doc: serde_json::Value = store::read_json(&input)?;
            let (cleaned, stats) = cleaner::clean_document(&doc, run_date);
            store::write_json_atomic(&output, &cleaned)?;
            for (collection, s) in &stats {
                println!(
                    "{}: {} in, {} out ({} malformed, {} unnamed, {} duplicates, {} bad links, {} bad images)",
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
            Ok(())
        }
        Commands::Validate { input, output, report } => {
            let doc: serde_json::Value = store::read_json(&input)?;
            let (accepted, verdicts) = validator::validate_document(&doc);
            store::write_json_atomic(&output, &accepted)?;
            store::write_json_atomic(&report, &verdicts)?;
            println!(
                "Accepted {} pens, {} inks; rejected {}",
                verdicts.accepted_pens,
                verdicts.accepted_inks,
                verdicts.rejected.len()
            );
            for r in verdicts.rejected.iter().take(20) {
                let reasons: Vec<String> = r.errors.iter().map(|e| format!("{} {}", e.field, e.message)).collect();
                println!(
                    "  {} #{} {}: {}",
                    r.collection,
                    r.index,
                    r.id.as_deref().unwrap_or("-"),
                    truncate(&reasons.join("; "), 80)
                );
            }
            Ok(())
        }
        Commands::Links {
            input,
            output,
            collection,
            select,
            images,
            report,
            write,
        } => {
            let settings = pipeline_settings(&cli.config)?;
            let collection = resolve_collection(&input, collection)?;
            let in_place = output.as_ref().is_none_or(|o| o == &input);
            if in_place && !write.execute {
                println!("Dry run: pass --execute to annotate {} in place.", input.display());
            }

            let mut doc = CatalogDocument::load(&input, collection)?;
            let selection = select.selection(settings.links.priority_limit);
            let probe = ProbeSettings::from_config(&settings.links, images);
            let prober = Prober::new(&probe)?;
            let mut cache = ProbeCache::new();
            let (counts, problems) = links::validate_links(
                &mut doc.products,
                selection,
                &prober,
                &probe,
                &mut cache,
                run_date,
                &cancel,
            )
            .await;
            let (summary, details) = links::summarize(&doc.products);

            println!("Selection:        {}", selection.describe());
            println!("Requests:         {} ({} short-circuited)", counts.requests, counts.short_circuited);
            println!("Records w/ links: {} of {}", summary.records_with_links, summary.total_records);
            println!(
                "Links:            {} valid, {} invalid, {} unchecked",
                summary.valid_links, summary.invalid_links, summary.unchecked_links
            );
            for p in problems.iter().take(20) {
                println!("  {} {} {}", p.status, truncate(&p.id, 30), truncate(&p.url, 70));
            }

            if let Some(path) = report {
                let report = LinkReport {
                    generated_at: started_at,
                    collection,
                    selection: selection.describe(),
                    run: counts,
                    summary,
                    problems,
                    details,
                };
                store::write_json_atomic(&path, &report)?;
            }

            match output {
                Some(out) if out != input => doc.save(&out)?,
                _ if write.execute => {
                    if !write.no_backup {
                        let backup_dir = write.backup_dir.clone().unwrap_or_else(|| default_backup_dir(&input));
                        store::backup(&input, &backup_dir, collection, started_at.naive_utc())?;
                    }
                    doc.save(&input)?;
                }
                _ => {}
            }
            Ok(())
        }
        Commands::Merge {
            input,
            store_dir,
            no_merge,
            report,
            write,
        } => {
            let batch: ProductBatch = store::read_json(&input)?;
            let opts = merge_options(&write, &store_dir, no_merge, run_date, started_at);
            let mut reports = Vec::new();
            let mut failed = None;
            for collection in Collection::ALL {
                let incoming = batch.collection(collection).to_vec();
                if incoming.is_empty() && !no_merge {
                    continue;
                }
                let store_path = store_dir.join(format!("{}.json", collection.key()));
                match merge::reconcile(&store_path, collection, incoming, &opts) {
                    Ok(r) => {
                        println!("{}", r.summary());
                        if let Some(b) = &r.backup {
                            println!("  backup: {}", b);
                        }
                        reports.push(r);
                    }
                    Err(e) => {
                        println!("{}: merge failed: {}", collection, e);
                        failed = Some(anyhow::Error::new(e).context(format!("Failed to merge {}", collection)));
                        break;
                    }
                }
            }
            if let Some(path) = report {
                store::write_json_atomic(&path, &reports)?;
            }
            failed.map_or(Ok(()), Err)
        }
        Commands::Update {
            input,
            store_dir,
            report_dir,
            write,
        } => {
            let batch: ProductBatch = store::read_json(&input)?;
            let opts = merge_options(&write, &store_dir, false, run_date, started_at);
            for collection in Collection::ALL {
                let store_path = store_dir.join(format!("{}.json", collection.key()));
                let report_path = report_dir.join(format!("update-report-{}.json", collection.key()));
                let r = incremental::run(
                    &store_path,
                    collection,
                    batch.collection(collection).to_vec(),
                    &opts,
                    Some(&report_path),
                )?;
                println!(
                    "{}: {} new, {} updated, {} not newer{}",
                    collection,
                    r.new_items,
                    r.updated_items,
                    r.stale_items,
                    if r.dry_run { " (dry run)" } else { "" }
                );
                if let Some(prev) = &r.previous {
                    println!(
                        "  previous run {}: {} new, {} updated",
                        prev.ran_at, prev.new_items, prev.updated_items
                    );
                }
            }
            Ok(())
        }
        Commands::Quality {
            input,
            collection,
            report,
            limit,
        } => {
            let settings = pipeline_settings(&cli.config)?;
            let collection = resolve_collection(&input, collection)?;
            let doc = CatalogDocument::load(&input, collection)?;
            let r = quality::report(&doc.products, collection, &settings.quality, started_at);

            println!("{} {}: average score {:.1}", r.total, collection, r.average_score);
            for (band, count) in &r.distribution {
                println!("  {:<10} {}", band.label(), count);
            }
            let fc = &r.field_completeness;
            println!(
                "Complete: description {}, details {}, image {}, links {}, specs {}, tags {}, price {}",
                fc.description, fc.details, fc.main_image, fc.purchase_links, fc.specifications, fc.tags, fc.price
            );
            if !r.common_issues.is_empty() {
                println!("\n--- Common issues ---");
                for issue in &r.common_issues {
                    println!("  {:>4}  {}", issue.count, issue.issue);
                }
            }

            println!("\n{:>3} | {:<32} | {:>5} | {}", "#", "Record", "Score", "Fix first");
            println!("{}", "-".repeat(90));
            for (i, item) in r.priority.iter().take(limit).enumerate() {
                let first = item.suggestions.first().map(String::as_str).unwrap_or("-");
                println!(
                    "{:>3} | {:<32} | {:>5} | {}",
                    i + 1,
                    truncate(&item.name, 32),
                    item.score,
                    truncate(first, 44)
                );
            }

            if let Some(path) = report {
                store::write_json_atomic(&path, &r)?;
            }
            Ok(())
        }
        Commands::Run {
            store_dir,
            work_dir,
            source,
            links,
            select,
            images,
            no_merge,
            write,
        } => {
            let config = config::load(&cli.config)?;
            if !write.execute {
                println!("Dry run: the store will not be written (pass --execute).");
            }
            let opts = pipeline::RunOptions {
                merge: merge_options(&write, &store_dir, no_merge, run_date, started_at),
                store_dir,
                work_dir,
                only_source: source,
                links: links.then(|| select.selection(config.pipeline.links.priority_limit)),
                check_images: images,
                started_at,
            };
            let (summary, outcome) = pipeline::run(&config, &opts, &cancel).await;
            summary.print();
            outcome
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Token cancelled on Ctrl-C or after `timeout` seconds.
fn cancellation(timeout: Option<u64>) -> CancellationToken {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight requests");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!("Run timeout of {}s reached; no new requests", secs);
            on_timeout.cancel();
        });
    }
    cancel
}

fn pipeline_settings(config: &Path) -> Result<PipelineSettings> {
    if config.exists() {
        config::load_pipeline_settings(Some(config))
    } else {
        info!("{} not found; using default pipeline settings", config.display());
        config::load_pipeline_settings(None)
    }
}

fn resolve_collection(input: &Path, explicit: Option<Collection>) -> Result<Collection> {
    match explicit.or_else(|| Collection::infer_from_path(input)) {
        Some(c) => Ok(c),
        None => bail!(
            "Cannot tell whether {} holds pens or inks; pass --collection",
            input.display()
        ),
    }
}

fn default_backup_dir(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("backups")
}

fn merge_options(
    write: &WriteArgs,
    store_dir: &Path,
    replace: bool,
    run_date: NaiveDate,
    started_at: DateTime<Utc>,
) -> MergeOptions {
    MergeOptions {
        execute: write.execute && !write.dry_run,
        backup: !write.no_backup,
        replace,
        backup_dir: write
            .backup_dir
            .clone()
            .unwrap_or_else(|| store_dir.join("backups")),
        run_date,
        now: started_at.naive_utc(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
