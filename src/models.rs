//! Data models shared by the navigation, fetch and extraction stages.
//!
//! - [`ArchiveEntry`]: a candidate article link discovered on an archive page
//! - [`ArticleRecord`]: the normalized article produced by the pipeline
//! - [`CrawlLimits`]: run bounds applied to navigation and fetching
//! - [`FieldName`]: the record fields an extraction rule can target

use chrono::{DateTime, Local, NaiveDateTime};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// A link discovered on an archive or listing page.
///
/// The hints are raw listing-page text. They are only consulted when the
/// article page itself yields nothing for the corresponding field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Absolute article URL.
    pub url: String,
    /// Date text shown next to the link, if any.
    pub published_time_hint: Option<String>,
    /// Teaser text shown next to the link, if any.
    pub description_hint: Option<String>,
}

#[cfg(test)]
impl ArchiveEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            published_time_hint: None,
            description_hint: None,
        }
    }

    pub fn with_published_time_hint(mut self, hint: impl Into<String>) -> Self {
        self.published_time_hint = Some(hint.into());
        self
    }
}

/// Names of the record fields an [`ExtractionRule`](crate::rules::ExtractionRule) can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Title,
    Authors,
    Description,
    Intro,
    Text,
    Keywords,
    PublishedTime,
    ModifiedTime,
    ImageLinks,
    Links,
}

impl FieldName {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldName::Title => "title",
            FieldName::Authors => "authors",
            FieldName::Description => "description",
            FieldName::Intro => "intro",
            FieldName::Text => "text",
            FieldName::Keywords => "keywords",
            FieldName::PublishedTime => "published_time",
            FieldName::ModifiedTime => "modified_time",
            FieldName::ImageLinks => "image_links",
            FieldName::Links => "links",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized article.
///
/// Built once by the pipeline and moved into the output sink; nothing holds
/// on to it afterwards. Missing values are empty strings, empty collections
/// or an `"unknown"` publication time.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleRecord {
    pub crawl_time: DateTime<Local>,
    pub long_url: String,
    pub short_url: String,
    pub site: String,
    pub title: String,
    pub authors: Vec<String>,
    pub description: String,
    pub intro: String,
    pub text: String,
    pub keywords: BTreeSet<String>,
    #[serde(serialize_with = "serialize_known_or_unknown")]
    pub published_time: Option<NaiveDateTime>,
    pub image_links: Vec<String>,
    pub links: BTreeSet<String>,
}

fn serialize_known_or_unknown<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(ts) => serializer.serialize_str(&ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => serializer.serialize_str("unknown"),
    }
}

/// Bounds for one crawl run. Zero or unset means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlLimits {
    /// Maximum number of article links handed to the fetch stage per site.
    pub max_articles: Option<usize>,
    /// Maximum number of archive units (months, departments) visited per site.
    pub max_archive_units: Option<usize>,
    /// Only expand archive groups belonging to this year.
    pub target_year: Option<i32>,
    /// Skip archive groups for months before this one (1-12).
    pub min_month: Option<u32>,
    /// Stop issuing new fetches once this many seconds have elapsed.
    pub time_budget_secs: Option<u64>,
}

impl CrawlLimits {
    pub fn max_articles(&self) -> Option<usize> {
        self.max_articles.filter(|n| *n > 0)
    }

    pub fn max_archive_units(&self) -> Option<usize> {
        self.max_archive_units.filter(|n| *n > 0)
    }

    pub fn target_year(&self) -> Option<i32> {
        self.target_year.filter(|y| *y > 0)
    }

    pub fn min_month(&self) -> Option<u32> {
        self.min_month.filter(|m| (1..=12).contains(m))
    }

    pub fn time_budget(&self) -> Option<std::time::Duration> {
        self.time_budget_secs
            .filter(|s| *s > 0)
            .map(std::time::Duration::from_secs)
    }

    /// Keep only the first `max_articles` items, preserving order.
    pub fn truncate<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if let Some(max) = self.max_articles() {
            items.truncate(max);
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_record() -> ArticleRecord {
        ArticleRecord {
            crawl_time: Local::now(),
            long_url: "https://www.golem.de/news/foo-2011-151234.html".to_string(),
            short_url: "https://glm.io/151234".to_string(),
            site: "golem".to_string(),
            title: "Foo: Bar".to_string(),
            authors: vec!["Anna Beispiel".to_string()],
            description: String::new(),
            intro: String::new(),
            text: "Body".to_string(),
            keywords: BTreeSet::new(),
            published_time: None,
            image_links: vec![],
            links: BTreeSet::new(),
        }
    }

    #[test]
    fn test_truncate_keeps_first_entries_in_order() {
        let limits = CrawlLimits {
            max_articles: Some(3),
            ..Default::default()
        };
        let entries: Vec<ArchiveEntry> = (0..10)
            .map(|i| ArchiveEntry::new(format!("https://example.com/{i}.html")))
            .collect();

        let truncated = limits.truncate(entries);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated[0].url, "https://example.com/0.html");
        assert_eq!(truncated[1].url, "https://example.com/1.html");
        assert_eq!(truncated[2].url, "https://example.com/2.html");
    }

    #[test]
    fn test_zero_limits_are_unbounded() {
        let limits = CrawlLimits {
            max_articles: Some(0),
            max_archive_units: Some(0),
            target_year: Some(0),
            min_month: Some(0),
            time_budget_secs: Some(0),
        };
        assert_eq!(limits.max_articles(), None);
        assert_eq!(limits.max_archive_units(), None);
        assert_eq!(limits.target_year(), None);
        assert_eq!(limits.min_month(), None);
        assert_eq!(limits.time_budget(), None);
        assert_eq!(limits.truncate(vec![1, 2, 3]).len(), 3);
    }

    #[test]
    fn test_unknown_published_time_serialization() {
        let json = serde_json::to_value(sample_record()).unwrap();
        assert_eq!(json["published_time"], "unknown");
    }

    #[test]
    fn test_known_published_time_serialization() {
        let mut record = sample_record();
        record.published_time = NaiveDate::from_ymd_opt(2019, 11, 21)
            .and_then(|d| d.and_hms_opt(10, 50, 0));
        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json["published_time"], "2019-11-21T10:50:00");
        assert_eq!(json["site"], "golem");
    }

    #[test]
    fn test_field_name_strings() {
        assert_eq!(FieldName::PublishedTime.as_str(), "published_time");
        assert_eq!(FieldName::ImageLinks.to_string(), "image_links");
        let parsed: FieldName = serde_yaml::from_str("modified_time").unwrap();
        assert_eq!(parsed, FieldName::ModifiedTime);
    }
}
