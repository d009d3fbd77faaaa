//! Archive traversal.
//!
//! The [`ArchiveNavigator`] walks a site's archive units (a single index
//! page, one page per month, or a set of linked department pages), follows
//! pagination, optionally collapses and re-expands year/month groups on
//! interactive archives, and extracts [`ArchiveEntry`] values from the
//! resulting listing.
//!
//! Page interaction goes through [`RenderedPageController`]. Two backends
//! exist:
//!
//! - [`StaticPageController`]: fetches HTML over HTTP; clicks are reported
//!   as failures since a static snapshot cannot execute scripts.
//! - `BrowserPageController` (feature `browser`): drives a headless
//!   Chromium through `chromiumoxide`.

#[cfg(feature = "browser")]
mod browser;
mod static_page;

#[cfg(feature = "browser")]
pub use browser::BrowserPageController;
pub use static_page::StaticPageController;

use crate::events::{EventCategory, EventSink};
use crate::fetch::FetchFailure;
use crate::models::{ArchiveEntry, CrawlLimits};
use crate::normalize::{absolutize, normalize_whitespace};
use crate::rules::{CompiledSelector, RuleError, SelectorSpec};
use chrono::{Datelike, Local, NaiveDate};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum NavigationError {
    /// The configured year group or listing container is absent.
    #[error("navigation target not found at {url}: {reason}")]
    TargetNotFound { url: String, reason: String },

    #[error("failed to load archive page {url}: {source}")]
    Load {
        url: String,
        #[source]
        source: FetchFailure,
    },

    #[error("render backend error: {0}")]
    Render(String),

    #[error("render backend `{0}` is not available in this build")]
    BackendUnavailable(&'static str),

    #[error("invalid selector `{0}`")]
    Selector(String),

    #[error("no page loaded")]
    NoPage,
}

/// Text and attributes of an element a controller offers for clicking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementDescriptor {
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

impl ElementDescriptor {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Group elements to click, as CSS selectors.
///
/// `group` matches the group element; `toggle` (relative to the group) is
/// the element actually clicked, defaulting to the group itself; `label`
/// (relative to the group) supplies the text the predicate sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickTarget {
    pub group: String,
    pub toggle: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClickReport {
    /// Elements accepted by the predicate.
    pub matched: usize,
    pub clicked: usize,
    /// One message per element whose click did not go through.
    pub failures: Vec<String>,
}

/// Satisfied once every selector matches at least one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitCondition {
    pub selectors: Vec<String>,
}

impl WaitCondition {
    pub fn is_met(&self, html: &Html) -> bool {
        self.selectors.iter().all(|css| {
            Selector::parse(css)
                .map(|sel| html.select(&sel).next().is_some())
                .unwrap_or(false)
        })
    }
}

/// Page interaction needed by archive traversal.
pub trait RenderedPageController {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError>;

    /// Click every element of `target` whose descriptor satisfies `predicate`.
    /// Individual click failures are reported, not raised.
    async fn click_all(
        &mut self,
        target: &ClickTarget,
        predicate: &(dyn Fn(&ElementDescriptor) -> bool + Sync),
    ) -> Result<ClickReport, NavigationError>;

    /// Poll until `condition` holds or `timeout` elapses; `Ok(false)` on timeout.
    async fn wait_until(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<bool, NavigationError>;

    /// Current page HTML.
    async fn snapshot(&mut self) -> Result<String, NavigationError>;
}

impl<T: RenderedPageController> RenderedPageController for &mut T {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        (**self).navigate(url).await
    }

    async fn click_all(
        &mut self,
        target: &ClickTarget,
        predicate: &(dyn Fn(&ElementDescriptor) -> bool + Sync),
    ) -> Result<ClickReport, NavigationError> {
        (**self).click_all(target, predicate).await
    }

    async fn wait_until(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<bool, NavigationError> {
        (**self).wait_until(condition, timeout).await
    }

    async fn snapshot(&mut self) -> Result<String, NavigationError> {
        (**self).snapshot().await
    }
}

/// Descriptors for every element matching `target` in a static document.
pub(crate) fn describe_groups(
    html: &Html,
    target: &ClickTarget,
) -> Result<Vec<ElementDescriptor>, NavigationError> {
    let group = parse_css(&target.group)?;
    let label = target.label.as_deref().map(parse_css).transpose()?;
    Ok(html
        .select(&group)
        .map(|el| {
            let text_source = label
                .as_ref()
                .and_then(|sel| el.select(sel).next())
                .unwrap_or(el);
            describe(text_source, el)
        })
        .collect())
}

fn describe(text_source: ElementRef<'_>, el: ElementRef<'_>) -> ElementDescriptor {
    let mut attributes: BTreeMap<String, String> = el
        .value()
        .attrs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    // The first link inside the group usually carries the month URL.
    if !attributes.contains_key("href") {
        if let Some(href) = el
            .select(&ANCHOR)
            .find_map(|a| a.value().attr("href"))
        {
            attributes.insert("href".to_string(), href.to_string());
        }
    }
    ElementDescriptor {
        text: normalize_whitespace(&text_source.text().collect::<String>()),
        attributes,
    }
}

/// One interactive group as a rendering backend sees it.
#[cfg(any(test, feature = "browser"))]
pub(crate) trait ClickableGroup: Sized {
    async fn describe(&self, target: &ClickTarget) -> Result<ElementDescriptor, NavigationError>;

    async fn click(self, target: &ClickTarget) -> Result<(), String>;
}

/// Click every group `predicate` accepts.
///
/// A group that cannot be read (for instance a node gone stale after an
/// earlier click re-rendered the widget) or whose click fails is recorded in
/// [`ClickReport::failures`] and left as it was; the remaining groups are
/// still processed.
#[cfg(any(test, feature = "browser"))]
pub(crate) async fn click_groups<G: ClickableGroup>(
    groups: Vec<G>,
    target: &ClickTarget,
    predicate: &(dyn Fn(&ElementDescriptor) -> bool + Sync),
) -> ClickReport {
    let mut report = ClickReport::default();
    for group in groups {
        let descriptor = match group.describe(target).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                report.failures.push(format!("unreadable group: {e}"));
                continue;
            }
        };
        if !predicate(&descriptor) {
            continue;
        }
        report.matched += 1;
        match group.click(target).await {
            Ok(()) => report.clicked += 1,
            Err(e) => report.failures.push(format!("{}: {e}", descriptor.text)),
        }
    }
    report
}

pub(crate) fn parse_css(css: &str) -> Result<Selector, NavigationError> {
    Selector::parse(css).map_err(|_| NavigationError::Selector(css.to_string()))
}

static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static HREF_YEAR_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/((?:19|20)\d{2})[/-](\d{1,2})(?:[/_.-]|$)").unwrap());
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b((?:19|20)\d{2})\b").unwrap());

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Static,
    Browser,
}

/// How a site's archive is divided into units.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveUnits {
    /// The root URL is the only unit.
    #[default]
    Single,
    /// One page per month; `{yyyy}`, `{yy}` and `{mm}` are substituted.
    Monthly { url_template: String },
    /// Units are the links matched by `selector` on the root page.
    Linked { selector: SelectorSpec },
}

fn default_max_pages() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    /// Anchor pointing at the next listing page.
    pub next_selector: SelectorSpec,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_month_names() -> Vec<String> {
    [
        "Januar", "Februar", "März", "April", "Mai", "Juni", "Juli", "August", "September",
        "Oktober", "November", "Dezember",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Collapsible year/month groups of an interactive archive.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupsConfig {
    /// Groups currently expanded.
    #[serde(default)]
    pub open_selector: Option<String>,
    /// Groups currently collapsed.
    pub closed_selector: String,
    #[serde(default)]
    pub toggle: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    /// Month names used to recognise a group's month from its label.
    #[serde(default = "default_month_names")]
    pub month_names: Vec<String>,
}

fn default_wait_timeout() -> u64 {
    10
}

fn default_poll_millis() -> u64 {
    250
}

/// Readiness condition after expanding groups.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitConfig {
    /// CSS selector with a `{year}` placeholder; one selector per awaited year.
    pub marker_template: String,
    /// Without a target year, wait for every year from this one to today.
    #[serde(default)]
    pub first_year: Option<i32>,
    #[serde(default = "default_wait_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_millis.max(10))
    }
}

fn default_href_attr() -> String {
    "href".to_string()
}

/// Where article links sit on an archive page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingConfig {
    pub container: SelectorSpec,
    /// One element per article, relative to the container.
    pub item: SelectorSpec,
    /// Anchor inside the item; the item itself when absent.
    #[serde(default)]
    pub link: Option<SelectorSpec>,
    #[serde(default = "default_href_attr")]
    pub href_attr: String,
    #[serde(default)]
    pub date_hint: Option<SelectorSpec>,
    #[serde(default)]
    pub description: Option<SelectorSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub render: RenderMode,
    #[serde(default)]
    pub units: ArchiveUnits,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub groups: Option<GroupsConfig>,
    #[serde(default)]
    pub wait: Option<WaitConfig>,
    pub listing: ListingConfig,
}

// ---------------------------------------------------------------------------
// Compiled plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum UnitPlan {
    Single,
    Monthly { url_template: String },
    Linked { selector: CompiledSelector },
}

#[derive(Debug, Clone)]
pub struct PaginationPlan {
    next: CompiledSelector,
    max_pages: usize,
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    open: Option<ClickTarget>,
    closed: ClickTarget,
    month_names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ListingPlan {
    container: CompiledSelector,
    item: CompiledSelector,
    link: Option<CompiledSelector>,
    href_attr: String,
    date_hint: Option<CompiledSelector>,
    description: Option<CompiledSelector>,
}

/// Validated archive configuration of one site.
#[derive(Debug, Clone)]
pub struct ArchivePlan {
    pub render: RenderMode,
    units: UnitPlan,
    pagination: Option<PaginationPlan>,
    groups: Option<GroupPlan>,
    wait: Option<WaitConfig>,
    listing: ListingPlan,
}

impl ArchivePlan {
    /// Interval at which a rendered page is re-checked while waiting.
    pub fn poll_interval(&self) -> Duration {
        self.wait
            .as_ref()
            .map(WaitConfig::poll_interval)
            .unwrap_or_else(|| Duration::from_millis(default_poll_millis()))
    }
}

fn check_css(css: &str) -> Result<String, RuleError> {
    Selector::parse(css).map_err(|e| RuleError::InvalidCss {
        expr: css.to_string(),
        reason: e.to_string(),
    })?;
    Ok(css.to_string())
}

impl ArchiveConfig {
    pub fn compile(&self) -> Result<ArchivePlan, RuleError> {
        let units = match &self.units {
            ArchiveUnits::Single => UnitPlan::Single,
            ArchiveUnits::Monthly { url_template } => UnitPlan::Monthly {
                url_template: url_template.clone(),
            },
            ArchiveUnits::Linked { selector } => UnitPlan::Linked {
                selector: selector.compile()?,
            },
        };

        let pagination = self
            .pagination
            .as_ref()
            .map(|p| {
                Ok::<_, RuleError>(PaginationPlan {
                    next: p.next_selector.compile()?,
                    max_pages: p.max_pages.max(1),
                })
            })
            .transpose()?;

        let groups = self
            .groups
            .as_ref()
            .map(|g| {
                let toggle = g.toggle.as_deref().map(check_css).transpose()?;
                let label = g.label.as_deref().map(check_css).transpose()?;
                let target = |group: String| ClickTarget {
                    group,
                    toggle: toggle.clone(),
                    label: label.clone(),
                };
                Ok::<_, RuleError>(GroupPlan {
                    open: g
                        .open_selector
                        .as_deref()
                        .map(check_css)
                        .transpose()?
                        .map(target),
                    closed: target(check_css(&g.closed_selector)?),
                    month_names: g.month_names.iter().map(|m| m.to_lowercase()).collect(),
                })
            })
            .transpose()?;

        if let Some(wait) = &self.wait {
            check_css(&wait.marker_template.replace("{year}", "2000"))?;
        }

        let l = &self.listing;
        let listing = ListingPlan {
            container: l.container.compile()?,
            item: l.item.compile()?,
            link: l.link.as_ref().map(SelectorSpec::compile).transpose()?,
            href_attr: l.href_attr.clone(),
            date_hint: l.date_hint.as_ref().map(SelectorSpec::compile).transpose()?,
            description: l.description.as_ref().map(SelectorSpec::compile).transpose()?,
        };

        Ok(ArchivePlan {
            render: self.render,
            units,
            pagination,
            groups,
            wait: self.wait.clone(),
            listing,
        })
    }
}

// ---------------------------------------------------------------------------
// Group filter
// ---------------------------------------------------------------------------

/// Decides which collapsed groups get expanded.
#[derive(Debug, Clone)]
pub struct GroupFilter<'a> {
    target_year: Option<i32>,
    min_month: Option<u32>,
    month_names: &'a [String],
}

impl<'a> GroupFilter<'a> {
    pub fn new(limits: &CrawlLimits, month_names: &'a [String]) -> Self {
        Self {
            target_year: limits.target_year(),
            min_month: limits.min_month(),
            month_names,
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.target_year.is_none() && self.min_month.is_none()
    }

    pub fn matches(&self, group: &ElementDescriptor) -> bool {
        let href = group.attr("href").unwrap_or_default();

        if let Some(year) = self.target_year {
            let year = year.to_string();
            let in_label = YEAR
                .captures_iter(&group.text)
                .any(|c| c[1] == *year);
            let in_href = HREF_YEAR_MONTH
                .captures(href)
                .is_some_and(|c| c[1] == *year)
                || href.contains(&format!("/{year}"));
            if !in_label && !in_href {
                return false;
            }
        }

        if let Some(min) = self.min_month {
            if let Some(month) = self.month_of(group) {
                return month >= min;
            }
        }
        true
    }

    fn month_of(&self, group: &ElementDescriptor) -> Option<u32> {
        let href = group.attr("href").unwrap_or_default();
        if let Some(m) = HREF_YEAR_MONTH
            .captures(href)
            .and_then(|c| c[2].parse::<u32>().ok())
            .filter(|m| (1..=12).contains(m))
        {
            return Some(m);
        }
        let label = group.text.to_lowercase();
        self.month_names
            .iter()
            .position(|name| !name.is_empty() && label.contains(name.as_str()))
            .map(|i| i as u32 + 1)
    }
}

// ---------------------------------------------------------------------------
// Navigator
// ---------------------------------------------------------------------------

/// Per-page traversal states, visited in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    Loaded,
    Collapsing,
    Expanding,
    Waiting,
    Extracted,
}

struct PageResult {
    entries: Vec<ArchiveEntry>,
    next_page: Option<String>,
}

/// Produces the ordered, URL-unique entry list of one site.
pub struct ArchiveNavigator<'a, C> {
    controller: C,
    site: &'a str,
    root: &'a Url,
    plan: &'a ArchivePlan,
    limits: &'a CrawlLimits,
    sink: &'a dyn EventSink,
    today: NaiveDate,
}

impl<'a, C: RenderedPageController> ArchiveNavigator<'a, C> {
    pub fn new(
        controller: C,
        site: &'a str,
        root: &'a Url,
        plan: &'a ArchivePlan,
        limits: &'a CrawlLimits,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            controller,
            site,
            root,
            plan,
            limits,
            sink,
            today: Local::now().date_naive(),
        }
    }

    /// Fix the date monthly units are counted back from.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Walk every archive unit and its follow-up pages.
    ///
    /// # Returns
    ///
    /// Entries in discovery order, unique by URL and truncated to
    /// `max_articles`.
    ///
    /// # Errors
    ///
    /// Only the first archive page is fatal: when it cannot be loaded or
    /// lacks the configured target, the site is misconfigured and
    /// [`NavigationError`] is returned. Later units and pages that fail are
    /// logged, recorded as events and skipped; the entries collected so far
    /// are kept.
    #[instrument(level = "info", skip_all, fields(site = %self.site))]
    pub async fn run(mut self) -> Result<Vec<ArchiveEntry>, NavigationError> {
        let units = self.archive_units().await?;
        info!(units = units.len(), "Resolved archive units");

        let max_articles = self.limits.max_articles();
        let mut seen_urls = HashSet::new();
        let mut entries = Vec::new();
        let mut first_page = true;

        'units: for unit in units {
            let mut page_url = Some(unit);
            let mut pages = 0usize;
            while let Some(url) = page_url.take() {
                let page = match self.traverse_page(&url).await {
                    Ok(page) => page,
                    Err(e) if first_page => return Err(e),
                    Err(e) => {
                        self.skip_page(&url, &e);
                        continue 'units;
                    }
                };
                first_page = false;
                pages += 1;
                debug!(%url, found = page.entries.len(), "Archive page extracted");

                for entry in page.entries {
                    if seen_urls.insert(entry.url.clone()) {
                        entries.push(entry);
                    }
                }
                if max_articles.is_some_and(|max| entries.len() >= max) {
                    break 'units;
                }

                if let Some(pagination) = &self.plan.pagination {
                    if pages < pagination.max_pages {
                        page_url = page.next_page.filter(|next| *next != url);
                    }
                }
            }
        }

        let entries = self.limits.truncate(entries);
        info!(count = entries.len(), "Archive traversal complete");
        Ok(entries)
    }

    async fn archive_units(&mut self) -> Result<Vec<String>, NavigationError> {
        let max_units = self.limits.max_archive_units();
        match &self.plan.units {
            UnitPlan::Single => Ok(vec![self.root.to_string()]),
            UnitPlan::Monthly { url_template } => Ok(monthly_units(
                url_template,
                self.today,
                self.limits.target_year(),
                self.limits.min_month(),
                max_units,
            )),
            UnitPlan::Linked { selector } => {
                let root = self.root.to_string();
                self.controller.navigate(&root).await?;
                let html = self.controller.snapshot().await?;
                let doc = Html::parse_document(&html);
                let units = selector
                    .values(doc.root_element())
                    .iter()
                    .filter_map(|href| absolutize(self.root, href))
                    .unique()
                    .take(max_units.unwrap_or(usize::MAX))
                    .collect::<Vec<_>>();
                if units.is_empty() {
                    return Err(NavigationError::TargetNotFound {
                        url: root,
                        reason: format!("no archive units match `{}`", selector.spec().expr()),
                    });
                }
                Ok(units)
            }
        }
    }

    async fn traverse_page(&mut self, url: &str) -> Result<PageResult, NavigationError> {
        self.controller.navigate(url).await?;
        let plan = self.plan;
        let filter = plan
            .groups
            .as_ref()
            .map(|g| GroupFilter::new(self.limits, &g.month_names));

        let mut state = NavState::Loaded;
        loop {
            debug!(%url, ?state, "Navigator state");
            state = match state {
                NavState::Loaded => {
                    self.ensure_target_year(url, filter.as_ref()).await?;
                    NavState::Collapsing
                }
                NavState::Collapsing => {
                    if let Some(open) = plan.groups.as_ref().and_then(|g| g.open.as_ref()) {
                        let report = self.controller.click_all(open, &|_| true).await?;
                        self.report_clicks(url, "collapse", report);
                    }
                    NavState::Expanding
                }
                NavState::Expanding => {
                    if let (Some(groups), Some(filter)) = (&plan.groups, &filter) {
                        let report = self
                            .controller
                            .click_all(&groups.closed, &|d| filter.matches(d))
                            .await?;
                        self.report_clicks(url, "expand", report);
                    }
                    NavState::Waiting
                }
                NavState::Waiting => {
                    if let Some(wait) = &plan.wait {
                        let condition = self.wait_condition(wait);
                        let timeout = Duration::from_secs(wait.timeout_secs);
                        if !self.controller.wait_until(&condition, timeout).await? {
                            warn!(%url, selectors = ?condition.selectors, "Archive did not become ready; extracting what is present");
                            self.sink
                                .warning(self.site, url, EventCategory::NavigationTimeout);
                        }
                    }
                    NavState::Extracted
                }
                NavState::Extracted => {
                    let html = self.controller.snapshot().await?;
                    return self.extract(url, &html);
                }
            };
        }
    }

    /// With a target year and collapsible groups, some group must belong to
    /// that year.
    async fn ensure_target_year(
        &mut self,
        url: &str,
        filter: Option<&GroupFilter<'_>>,
    ) -> Result<(), NavigationError> {
        let (Some(groups), Some(filter), Some(year)) =
            (&self.plan.groups, filter, self.limits.target_year())
        else {
            return Ok(());
        };
        let html = self.controller.snapshot().await?;
        let doc = Html::parse_document(&html);
        let mut candidates = describe_groups(&doc, &groups.closed)?;
        if let Some(open) = &groups.open {
            candidates.extend(describe_groups(&doc, open)?);
        }
        let year_only = GroupFilter {
            min_month: None,
            ..filter.clone()
        };
        if candidates.iter().any(|g| year_only.matches(g)) {
            Ok(())
        } else {
            Err(NavigationError::TargetNotFound {
                url: url.to_string(),
                reason: format!("no archive group for year {year}"),
            })
        }
    }

    fn wait_condition(&self, wait: &WaitConfig) -> WaitCondition {
        let years: Vec<i32> = match (self.limits.target_year(), wait.first_year) {
            (Some(year), _) => vec![year],
            (None, Some(first)) => (first..=self.today.year()).rev().collect(),
            (None, None) => vec![self.today.year()],
        };
        WaitCondition {
            selectors: years
                .into_iter()
                .map(|y| wait.marker_template.replace("{year}", &y.to_string()))
                .collect(),
        }
    }

    fn skip_page(&self, url: &str, error: &NavigationError) {
        warn!(%url, error = %error, "Archive page failed; continuing with the next unit");
        let category = match error {
            NavigationError::Load { .. } => EventCategory::FetchFailed,
            _ => EventCategory::NavigationTimeout,
        };
        self.sink.warning(self.site, url, category);
    }

    fn report_clicks(&self, url: &str, action: &str, report: ClickReport) {
        debug!(%url, action, matched = report.matched, clicked = report.clicked, "Group clicks");
        for failure in &report.failures {
            warn!(%url, action, reason = %failure, "Group click failed; group stays as it was");
            self.sink.warning(self.site, url, EventCategory::ClickFailed);
        }
    }

    fn extract(&self, url: &str, html: &str) -> Result<PageResult, NavigationError> {
        let doc = Html::parse_document(html);
        let root = doc.root_element();
        let base = Url::parse(url).unwrap_or_else(|_| self.root.clone());
        let listing = &self.plan.listing;

        let containers: Vec<ElementRef<'_>> = listing.container.elements(root).collect();
        if containers.is_empty() {
            return Err(NavigationError::TargetNotFound {
                url: url.to_string(),
                reason: format!(
                    "listing container `{}` not found",
                    listing.container.spec().expr()
                ),
            });
        }

        let mut entries = Vec::new();
        for container in containers {
            for item in listing.item.elements(container) {
                let anchor = match &listing.link {
                    Some(link) => link.elements(item).next(),
                    None => Some(item),
                };
                let Some(entry_url) = anchor
                    .and_then(|a| a.value().attr(&listing.href_attr))
                    .and_then(|href| absolutize(&base, href))
                else {
                    continue;
                };
                entries.push(ArchiveEntry {
                    url: entry_url,
                    published_time_hint: hint(listing.date_hint.as_ref(), item),
                    description_hint: hint(listing.description.as_ref(), item),
                });
            }
        }

        let next_page = self.plan.pagination.as_ref().and_then(|p| {
            p.next
                .elements(root)
                .find_map(|a| a.value().attr("href"))
                .and_then(|href| absolutize(&base, href))
        });

        Ok(PageResult { entries, next_page })
    }
}

fn hint(selector: Option<&CompiledSelector>, item: ElementRef<'_>) -> Option<String> {
    let text = normalize_whitespace(&selector?.values(item).join(" "));
    (!text.is_empty()).then_some(text)
}

/// Monthly archive URLs, newest first.
///
/// With a target year the months of that year are listed from December (or
/// the current month, for the current year) down to `min_month`. Without
/// one, months are counted back from today, one unit unless
/// `max_units` says otherwise.
pub fn monthly_units(
    template: &str,
    today: NaiveDate,
    target_year: Option<i32>,
    min_month: Option<u32>,
    max_units: Option<usize>,
) -> Vec<String> {
    let months: Vec<(i32, u32)> = match target_year {
        Some(year) => {
            let last = if year == today.year() { today.month() } else { 12 };
            let first = min_month.unwrap_or(1);
            (first..=last).rev().map(|m| (year, m)).collect()
        }
        None => {
            let count = max_units.unwrap_or(1);
            let (mut year, mut month) = (today.year(), today.month());
            let mut out = Vec::with_capacity(count);
            for _ in 0..count {
                out.push((year, month));
                if month == 1 {
                    year -= 1;
                    month = 12;
                } else {
                    month -= 1;
                }
            }
            out
        }
    };

    months
        .into_iter()
        .take(max_units.unwrap_or(usize::MAX))
        .map(|(year, month)| {
            template
                .replace("{yyyy}", &format!("{year:04}"))
                .replace("{yy}", &format!("{:02}", year.rem_euclid(100)))
                .replace("{mm}", &format!("{month:02}"))
        })
        .collect()
}
