//! One site's crawl: archive traversal, deduplication, concurrent article
//! fetching and record output.

use crate::config::Site;
use crate::dedup::Deduplicator;
use crate::events::{EventCategory, EventSink};
use crate::fetch::{FetchFailure, PageFetcher};
use crate::models::{ArchiveEntry, CrawlLimits};
#[cfg(feature = "browser")]
use crate::navigator::BrowserPageController;
use crate::navigator::{
    ArchiveNavigator, NavigationError, RenderMode, RenderedPageController, StaticPageController,
};
use crate::outputs::RecordSink;
use crate::pipeline::{ArticlePipeline, Validator};
use futures::stream::{self, StreamExt};
use std::cell::Cell;
use std::future::ready;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Concurrent article fetches.
    pub workers: usize,
    pub limits: CrawlLimits,
}

/// Per-site counts logged at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteSummary {
    pub discovered: usize,
    pub skipped_seen: usize,
    pub fetched: usize,
    pub failed: usize,
    pub blocked: usize,
    pub dropped: usize,
    pub emitted: usize,
    pub elapsed: Duration,
}

impl SiteSummary {
    fn count(&mut self, outcome: Outcome) {
        self.fetched += 1;
        match outcome {
            Outcome::Emitted => self.emitted += 1,
            Outcome::Dropped => self.dropped += 1,
            Outcome::Blocked => self.blocked += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Emitted,
    Dropped,
    Blocked,
    Failed,
}

/// Everything a site crawl writes to or consults besides the page backends.
pub struct CrawlContext<'a, R> {
    pub dedup: &'a Deduplicator,
    pub events: &'a dyn EventSink,
    pub output: &'a R,
    pub settings: &'a RunSettings,
}

/// Crawl one site.
///
/// Fails only when archive traversal fails; per-article problems are
/// recorded as events and counted in the summary. Once the time budget is
/// spent no new fetches are issued, but in-flight ones complete.
///
/// # Arguments
///
/// * `site` - The validated site profile to crawl
/// * `controller` - Rendered-page backend used to walk the archive
/// * `fetcher` - Static backend used for article pages
/// * `ctx` - Dedup store, event sink, record sink and run settings
///
/// # Returns
///
/// A [`SiteSummary`] with per-outcome counts. Only URLs of emitted records
/// are marked seen, so dropped or failed articles are retried next run.
///
/// # Errors
///
/// [`NavigationError`] when the archive root cannot be traversed.
///
/// # Examples
///
/// ```ignore
/// let ctx = CrawlContext { dedup: &dedup, events: &events, output: &writer, settings: &settings };
/// let summary = crawl_site(&site, StaticPageController::new(fetcher.clone()), &fetcher, &ctx).await?;
/// info!(emitted = summary.emitted, "Site done");
/// ```
#[instrument(level = "info", skip_all, fields(site = %site.name))]
pub async fn crawl_site<C, F, R>(
    site: &Site,
    controller: C,
    fetcher: &F,
    ctx: &CrawlContext<'_, R>,
) -> Result<SiteSummary, NavigationError>
where
    C: RenderedPageController,
    F: PageFetcher,
    R: RecordSink,
{
    let started = Instant::now();
    let limits = &ctx.settings.limits;

    let entries = ArchiveNavigator::new(
        controller,
        &site.name,
        &site.root,
        &site.archive,
        limits,
        ctx.events,
    )
    .run()
    .await?;
    info!(count = entries.len(), "Archive entries discovered");

    let mut summary = SiteSummary {
        discovered: entries.len(),
        ..Default::default()
    };
    let skipped = Cell::new(0usize);
    let budget = limits.time_budget();
    let workers = ctx.settings.workers.max(1);

    let outcomes: Vec<Outcome> = stream::iter(entries)
        .take_while(|_| {
            let within = budget.is_none_or(|b| started.elapsed() < b);
            if !within {
                warn!("Time budget spent; no further articles are fetched");
            }
            ready(within)
        })
        .map(|entry| {
            let short_url = site.short_url.derive(&entry.url);
            (entry, short_url)
        })
        .filter(|(_, short_url)| {
            let fresh = ctx.dedup.should_fetch(short_url);
            if !fresh {
                skipped.set(skipped.get() + 1);
                ctx.events.info(&site.name, short_url, EventCategory::Exists);
            }
            ready(fresh)
        })
        .take(limits.max_articles().unwrap_or(usize::MAX))
        .map(|(entry, short_url)| process_entry(site, fetcher, ctx, entry, short_url))
        .buffer_unordered(workers)
        .collect()
        .await;

    summary.skipped_seen = skipped.get();
    for outcome in outcomes {
        summary.count(outcome);
    }
    summary.elapsed = started.elapsed();

    info!(
        discovered = summary.discovered,
        skipped_seen = summary.skipped_seen,
        fetched = summary.fetched,
        failed = summary.failed,
        blocked = summary.blocked,
        dropped = summary.dropped,
        emitted = summary.emitted,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Site crawl complete"
    );
    Ok(summary)
}

/// Crawl one site with the page backend its archive asks for.
pub async fn crawl_with_backend<F, R>(
    site: &Site,
    fetcher: F,
    ctx: &CrawlContext<'_, R>,
) -> Result<SiteSummary, NavigationError>
where
    F: PageFetcher + Clone,
    R: RecordSink,
{
    match site.archive.render {
        RenderMode::Static => {
            crawl_site(site, StaticPageController::new(fetcher.clone()), &fetcher, ctx).await
        }
        RenderMode::Browser => crawl_with_browser(site, &fetcher, ctx).await,
    }
}

#[cfg(feature = "browser")]
async fn crawl_with_browser<F, R>(
    site: &Site,
    fetcher: &F,
    ctx: &CrawlContext<'_, R>,
) -> Result<SiteSummary, NavigationError>
where
    F: PageFetcher,
    R: RecordSink,
{
    let mut controller = BrowserPageController::launch(site.archive.poll_interval()).await?;
    let result = crawl_site(site, &mut controller, fetcher, ctx).await;
    controller.close().await;
    result
}

#[cfg(not(feature = "browser"))]
async fn crawl_with_browser<F, R>(
    _site: &Site,
    _fetcher: &F,
    _ctx: &CrawlContext<'_, R>,
) -> Result<SiteSummary, NavigationError>
where
    F: PageFetcher,
    R: RecordSink,
{
    Err(NavigationError::BackendUnavailable("browser"))
}

async fn process_entry<F, R>(
    site: &Site,
    fetcher: &F,
    ctx: &CrawlContext<'_, R>,
    entry: ArchiveEntry,
    short_url: String,
) -> Outcome
where
    F: PageFetcher,
    R: RecordSink,
{
    let request_url = site.request_url(&entry.url);
    let html = match fetcher.fetch(&request_url).await {
        Ok(html) => html,
        Err(e) => {
            warn!(url = %request_url, error = %e, "Article fetch failed");
            ctx.events
                .warning(&site.name, &short_url, EventCategory::FetchFailed);
            return Outcome::Failed;
        }
    };

    let candidate = match ArticlePipeline::new(site, ctx.events).process(&entry, &short_url, &html) {
        Ok(record) => record,
        Err(FetchFailure::Blocked) => return Outcome::Blocked,
        Err(e) => {
            warn!(url = %request_url, error = %e, "Article processing failed");
            return Outcome::Failed;
        }
    };

    let Some(record) = Validator::new(ctx.events).validate(candidate) else {
        return Outcome::Dropped;
    };

    match ctx.output.emit(record).await {
        Ok(()) => {
            ctx.dedup.mark_seen(&short_url);
            Outcome::Emitted
        }
        Err(e) => {
            error!(url = %short_url, error = %e, "Failed to write record");
            Outcome::Failed
        }
    }
}
