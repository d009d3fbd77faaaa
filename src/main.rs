//! # Archive Crawler
//!
//! Crawls the archives of configured news sites and turns every article
//! not crawled before into a normalized JSON record.
//!
//! ## Usage
//!
//! ```sh
//! archive_crawler -c config/sites.yaml -o ./output
//! ```
//!
//! ## Architecture
//!
//! Each site runs through the same pipeline:
//! 1. **Navigation**: walk the archive (monthly pages, department listings,
//!    or a collapsible year/month widget) and collect article links
//! 2. **Deduplication**: skip links whose short URL was already recorded
//! 3. **Fetching**: download articles concurrently, `workers` at a time
//! 4. **Extraction**: apply the site's selector rules and normalize fields
//! 5. **Output**: append accepted records to `{output_dir}/{date}/{site}.jsonl`

use chrono::Local;
use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod crawl;
mod dedup;
mod events;
mod extract;
mod fetch;
mod models;
mod navigator;
mod normalize;
mod outputs;
mod pipeline;
mod rules;
mod utils;

use cli::Cli;
use config::load_config;
use crawl::{CrawlContext, RunSettings, crawl_with_backend};
use dedup::{Deduplicator, FileSeenSet, SeenSet};
use events::{CountingEventSink, TracingEventSink};
use fetch::{HttpFetcher, RetryFetch};
use outputs::json::JsonLinesSink;
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("archive_crawler starting up");

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let mut config = load_config(&args.config)?;
    config.apply_cli(&args);
    info!(
        workers = config.workers,
        limits = ?config.limits,
        "Effective run settings"
    );

    // Early check: output dir must be writable before anything is crawled
    if let Err(e) = ensure_writable_dir(&args.output_dir).await {
        error!(
            path = %args.output_dir,
            error = %e,
            "Output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }

    let seen_path = args.seen_file();
    let store: Arc<dyn SeenSet> = Arc::new(FileSeenSet::open(&seen_path)?);
    let dedup = Deduplicator::new(store);
    let events = CountingEventSink::new(TracingEventSink);
    let output = JsonLinesSink::create(&args.output_dir, Local::now().date_naive()).await?;
    let settings = RunSettings {
        workers: config.workers,
        limits: config.limits.clone(),
    };
    let ctx = CrawlContext {
        dedup: &dedup,
        events: &events,
        output: &output,
        settings: &settings,
    };

    let sites = config.compile_sites(&args.sites);
    if sites.is_empty() {
        warn!(requested = ?args.sites, "No site to crawl");
    }

    let mut total_emitted = 0usize;
    let mut failed_sites = 0usize;
    for site in &sites {
        let fetcher = match HttpFetcher::new(&site.request, config.fetch.timeout()) {
            Ok(client) => RetryFetch::new(client, config.fetch.retries, config.fetch.backoff()),
            Err(e) => {
                error!(site = %site.name, error = %e, "Failed to build HTTP client; skipping site");
                failed_sites += 1;
                continue;
            }
        };

        match crawl_with_backend(site, fetcher, &ctx).await {
            Ok(summary) => {
                total_emitted += summary.emitted;
                for (category, count) in events.counts_for(&site.name) {
                    info!(site = %site.name, %category, count, "Event tally");
                }
            }
            Err(e) => {
                failed_sites += 1;
                error!(site = %site.name, error = %e, "Site crawl failed");
            }
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        sites = sites.len(),
        failed_sites,
        total_emitted,
        elapsed_ms = elapsed.as_millis() as u64,
        elapsed_secs = elapsed.as_secs_f64(),
        "archive_crawler finished"
    );

    Ok(())
}
