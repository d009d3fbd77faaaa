//! Structured crawl events.
//!
//! Every per-article or per-page condition worth reporting (a field that
//! could not be extracted, a paywall, an already-seen URL, a navigation
//! timeout) is recorded through an [`EventSink`]. The default sink forwards
//! events to `tracing`; [`CountingEventSink`] additionally tallies them for
//! the end-of-run summary.

use crate::models::FieldName;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
}

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventCategory {
    /// A field rule exhausted all its selectors.
    Field(FieldName),
    MissingImportantProperty,
    Exists,
    Paywall,
    NavigationTimeout,
    ClickFailed,
    FetchFailed,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Field(field) => field.as_str(),
            EventCategory::MissingImportantProperty => "missingImportantProperty",
            EventCategory::Exists => "exists",
            EventCategory::Paywall => "paywall",
            EventCategory::NavigationTimeout => "navigationTimeout",
            EventCategory::ClickFailed => "clickFailed",
            EventCategory::FetchFailed => "fetchFailed",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlEvent {
    pub site: String,
    pub subject_url: String,
    pub category: EventCategory,
    pub severity: Severity,
}

/// Receiver for crawl events. Shared by concurrent fetch workers.
pub trait EventSink: Send + Sync {
    fn record(&self, event: CrawlEvent);

    fn info(&self, site: &str, subject_url: &str, category: EventCategory) {
        self.record(CrawlEvent {
            site: site.to_string(),
            subject_url: subject_url.to_string(),
            category,
            severity: Severity::Info,
        });
    }

    fn warning(&self, site: &str, subject_url: &str, category: EventCategory) {
        self.record(CrawlEvent {
            site: site.to_string(),
            subject_url: subject_url.to_string(),
            category,
            severity: Severity::Warning,
        });
    }
}

/// Forwards events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: CrawlEvent) {
        match event.severity {
            Severity::Info => info!(
                site = %event.site,
                url = %event.subject_url,
                category = %event.category,
                "crawl event"
            ),
            Severity::Warning => warn!(
                site = %event.site,
                url = %event.subject_url,
                category = %event.category,
                "crawl event"
            ),
        }
    }
}

/// Tallies events per `(site, category)` and forwards them to an inner sink.
#[derive(Debug, Default)]
pub struct CountingEventSink<S> {
    inner: S,
    counts: Mutex<BTreeMap<(String, EventCategory), usize>>,
}

impl<S: EventSink> CountingEventSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Per-category counts recorded for `site`.
    pub fn counts_for(&self, site: &str) -> BTreeMap<EventCategory, usize> {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts
            .iter()
            .filter(|((s, _), _)| s == site)
            .map(|((_, category), n)| (*category, *n))
            .collect()
    }
}

impl<S: EventSink> EventSink for CountingEventSink<S> {
    fn record(&self, event: CrawlEvent) {
        {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts
                .entry((event.site.clone(), event.category))
                .or_insert(0) += 1;
        }
        self.inner.record(event);
    }
}

/// Keeps every event in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<CrawlEvent>>,
}

#[cfg(test)]
impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CrawlEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, category: EventCategory) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.category == category)
            .count()
    }
}

#[cfg(test)]
impl EventSink for MemoryEventSink {
    fn record(&self, event: CrawlEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
