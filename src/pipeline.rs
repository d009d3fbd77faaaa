//! Per-article extraction and validation.
//!
//! [`ArticlePipeline::process`] turns one fetched article page into an
//! [`ArticleRecord`], reporting every field that stays empty. The
//! [`Validator`] then drops records lacking a title or body text.

use crate::config::Site;
use crate::events::{EventCategory, EventSink};
use crate::extract::FieldExtractor;
use crate::fetch::FetchFailure;
use crate::models::{ArchiveEntry, ArticleRecord, FieldName};
use crate::normalize::{absolutize_all, normalize_whitespace, resolve_authors};
use crate::utils::truncate_for_log;
use chrono::Local;
use itertools::Itertools;
use scraper::Html;
use tracing::{debug, info, instrument};

pub struct ArticlePipeline<'a> {
    site: &'a Site,
    sink: &'a dyn EventSink,
}

impl<'a> ArticlePipeline<'a> {
    pub fn new(site: &'a Site, sink: &'a dyn EventSink) -> Self {
        Self { site, sink }
    }

    /// Build a candidate record from `html`.
    ///
    /// Fails only with [`FetchFailure::Blocked`] when a paywall marker is
    /// present. Missing fields never fail the article; each one is recorded
    /// as a warning event and left empty.
    ///
    /// # Arguments
    ///
    /// * `entry` - The archive entry the page was reached from
    /// * `short_url` - Canonical URL stored in the record and used as event subject
    /// * `html` - The fetched article page
    ///
    /// # Returns
    ///
    /// An unvalidated [`ArticleRecord`]; pass it through the validator before
    /// emitting.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let pipeline = ArticlePipeline::new(&site, &events);
    /// let record = pipeline.process(&entry, "https://glm.io/145123", &html)?;
    /// assert_eq!(record.short_url, "https://glm.io/145123");
    /// ```
    #[instrument(level = "info", skip_all, fields(site = %self.site.name, url = %short_url))]
    pub fn process(
        &self,
        entry: &ArchiveEntry,
        short_url: &str,
        html: &str,
    ) -> Result<ArticleRecord, FetchFailure> {
        let site = self.site;
        let doc = Html::parse_document(html);
        let root = doc.root_element();

        if site.paywall_markers.iter().any(|m| m.matches_any(root)) {
            info!("Paywall detected; skipping article");
            self.sink.info(&site.name, short_url, EventCategory::Paywall);
            return Err(FetchFailure::Blocked);
        }

        let extractor = FieldExtractor::new(&site.rules);
        let scalar = |field| normalize_whitespace(&extractor.scalar(field, root));
        let list = |field| -> Vec<String> {
            extractor
                .list(field, root)
                .iter()
                .map(|v| normalize_whitespace(v))
                .filter(|v| !v.is_empty())
                .unique()
                .collect()
        };

        let title = scalar(FieldName::Title);
        self.check(&extractor, FieldName::Title, title.is_empty(), short_url);

        let intro = scalar(FieldName::Intro);
        self.check(&extractor, FieldName::Intro, intro.is_empty(), short_url);

        let assembled = site.text.assemble(root, &site.author_codes);
        if assembled.text.is_empty() {
            self.sink
                .warning(&site.name, short_url, EventCategory::Field(FieldName::Text));
        }

        let mut authors = list(FieldName::Authors);
        if authors.is_empty() {
            authors = resolve_authors(
                &assembled.credits,
                &site.author_codes,
                site.default_byline.as_deref(),
            );
        }
        self.check(&extractor, FieldName::Authors, authors.is_empty(), short_url);

        let mut description = scalar(FieldName::Description);
        if description.is_empty() {
            if let Some(hint) = &entry.description_hint {
                description = normalize_whitespace(hint);
            }
        }
        self.check(&extractor, FieldName::Description, description.is_empty(), short_url);

        let keywords = list(FieldName::Keywords)
            .into_iter()
            .filter(|k| !site.keyword_stoplist.contains(&k.to_lowercase()))
            .collect::<std::collections::BTreeSet<_>>();
        self.check(&extractor, FieldName::Keywords, keywords.is_empty(), short_url);

        let primary = scalar(FieldName::PublishedTime);
        let modified = scalar(FieldName::ModifiedTime);
        let published_time = site.dates.resolve(
            &[
                Some(primary.as_str()).filter(|s| !s.is_empty()),
                Some(modified.as_str()).filter(|s| !s.is_empty()),
                entry.published_time_hint.as_deref(),
            ],
            &site.name,
            short_url,
            self.sink,
        );

        let image_links = absolutize_all(&site.root, &extractor.list(FieldName::ImageLinks, root));
        self.check(&extractor, FieldName::ImageLinks, image_links.is_empty(), short_url);

        let links = absolutize_all(&site.root, &extractor.list(FieldName::Links, root))
            .into_iter()
            .collect::<std::collections::BTreeSet<_>>();
        self.check(&extractor, FieldName::Links, links.is_empty(), short_url);

        debug!(
            title = %truncate_for_log(&title, 80),
            text_len = assembled.text.len(),
            authors = authors.len(),
            ?published_time,
            "Extracted article"
        );

        Ok(ArticleRecord {
            crawl_time: Local::now(),
            long_url: entry.url.clone(),
            short_url: short_url.to_string(),
            site: site.name.clone(),
            title,
            authors,
            description,
            intro,
            text: assembled.text,
            keywords,
            published_time,
            image_links,
            links,
        })
    }

    /// Warn about an empty field unless its rule opted out.
    fn check(&self, extractor: &FieldExtractor<'_>, field: FieldName, empty: bool, url: &str) {
        if !empty {
            return;
        }
        if extractor.rule(field).is_some_and(|rule| rule.warn_if_empty) {
            self.sink
                .warning(&self.site.name, url, EventCategory::Field(field));
        }
    }
}

/// Final gate before output: title and text are required.
pub struct Validator<'a> {
    sink: &'a dyn EventSink,
}

impl<'a> Validator<'a> {
    pub fn new(sink: &'a dyn EventSink) -> Self {
        Self { sink }
    }

    pub fn validate(&self, record: ArticleRecord) -> Option<ArticleRecord> {
        if record.title.is_empty() || record.text.is_empty() {
            info!(
                site = %record.site,
                url = %record.short_url,
                has_title = !record.title.is_empty(),
                has_text = !record.text.is_empty(),
                "Dropping article without title or text"
            );
            self.sink.info(
                &record.site,
                &record.short_url,
                EventCategory::MissingImportantProperty,
            );
            return None;
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;
    use crate::events::{MemoryEventSink, Severity};

    const SITE: &str = r#"
name: golem
root_url: "https://www.golem.de/"
archive:
  listing:
    container: "ol.list-articles"
    item: "li a"
rules:
  - field: title
    mode: joined
    separator: ": "
    selectors:
      - "h1 span.head1"
      - "h1 span.head5"
  - field: authors
    selectors: ["span.authors a[rel=author]"]
  - field: description
    selectors: ["meta[name=description]::attr(content)"]
  - field: intro
    selectors: ["p.intro"]
  - field: keywords
    mode: union_list
    split: ","
    selectors: ["meta[name=keywords]::attr(content)"]
  - field: published_time
    selectors:
      - xpath: '//time[@itemprop="datePublished"]/@datetime'
  - field: modified_time
    selectors: ["time.modified::attr(datetime)"]
  - field: image_links
    warn_if_empty: false
    mode: union_list
    selectors: ["figure img::attr(src)"]
  - field: links
    mode: union_list
    selectors: ["div.formatted a::attr(href)"]
paywall_markers:
  - "div.paywall"
text:
  container: "div.formatted"
  blocks: "p, h3"
  fallback: "article"
  see_also_marker: "Mehr zum Thema"
  strip_credits: true
dates:
  - format: "%Y-%m-%dT%H:%M:%S%z"
  - format: "%d. %B %Y, %H:%M Uhr"
    locale: de
author_codes:
  "(ase)": "Anna Seifert"
  "(bkl)": "Bernd Klein"
default_byline: "Redaktion"
keyword_stoplist: ["golem"]
"#;

    const ARTICLE: &str = r#"<html><head>
        <meta name="description" content="  Die Sonde   startet später .">
        <meta name="keywords" content="Raumfahrt, Golem, ESA">
        </head><body><article>
        <h1><span class="head1">Raumfahrt</span><span class="head5">Start verschoben</span></h1>
        <span class="authors"><a rel="author">Anna Seifert</a></span>
        <time itemprop="datePublished" datetime="2019-11-21T10:50:00+0100"></time>
        <p class="intro">Die ESA verschiebt den Start.</p>
        <figure><img src="/img/sonde.jpg"></figure>
        <div class="formatted">
          <p>Erster   Absatz.</p>
          <h3>Zwischentitel</h3>
          <p>Zweiter Absatz mit <a href="/news/mehr-1911-1.html">Link</a>.</p>
          <script>var x = 1;</script>
        </div>
        </article></body></html>"#;

    fn site() -> Site {
        serde_yaml::from_str::<SiteConfig>(SITE)
            .unwrap()
            .compile()
            .unwrap()
    }

    fn entry() -> ArchiveEntry {
        ArchiveEntry::new("https://www.golem.de/news/sonde-1911-145123.html")
    }

    #[test]
    fn test_complete_article() {
        let site = site();
        let sink = MemoryEventSink::new();
        let record = ArticlePipeline::new(&site, &sink)
            .process(&entry(), "https://glm.io/145123", ARTICLE)
            .unwrap();

        assert_eq!(record.title, "Raumfahrt: Start verschoben");
        assert_eq!(record.authors, vec!["Anna Seifert"]);
        assert_eq!(record.description, "Die Sonde startet später.");
        assert_eq!(record.intro, "Die ESA verschiebt den Start.");
        assert_eq!(
            record.text,
            "Erster Absatz.\n\nZwischentitel\n\nZweiter Absatz mit Link."
        );
        assert_eq!(
            record.keywords.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["ESA", "Raumfahrt"]
        );
        assert_eq!(
            record.published_time.map(|t| t.to_string()),
            Some("2019-11-21 10:50:00".to_string())
        );
        assert_eq!(record.image_links, vec!["https://www.golem.de/img/sonde.jpg"]);
        assert!(record.links.contains("https://www.golem.de/news/mehr-1911-1.html"));
        assert_eq!(record.short_url, "https://glm.io/145123");
        assert_eq!(record.site, "golem");
        assert!(sink.events().is_empty(), "unexpected events: {:?}", sink.events());
    }

    #[test]
    fn test_paywall_is_blocked_with_event() {
        let site = site();
        let sink = MemoryEventSink::new();
        let html = ARTICLE.replace("<article>", r#"<article><div class="paywall"></div>"#);
        let result = ArticlePipeline::new(&site, &sink).process(&entry(), "https://glm.io/145123", &html);
        assert_eq!(result.unwrap_err(), FetchFailure::Blocked);
        assert_eq!(sink.count(EventCategory::Paywall), 1);
    }

    #[test]
    fn test_sparse_article_falls_back_and_warns() {
        let site = site();
        let sink = MemoryEventSink::new();
        let html = r#"<html><body><article>
            <p>Die Sonde bleibt am Boden.</p>
            <p>Ein neuer Termin steht aus.</p>
            <p>Mehr zum Thema: Raumfahrt</p>
            <p>Alter Artikel</p>
            </article></body></html>"#;
        let entry = ArchiveEntry {
            description_hint: Some("Teaser  aus der Liste".to_string()),
            ..entry().with_published_time_hint("21. November 2019, 10:50 Uhr")
        };

        let record = ArticlePipeline::new(&site, &sink)
            .process(&entry, "https://glm.io/145123", html)
            .unwrap();

        assert_eq!(record.title, "");
        assert_eq!(
            record.text,
            "Die Sonde bleibt am Boden.\n\nEin neuer Termin steht aus."
        );
        assert_eq!(record.authors, vec!["Redaktion"]);
        assert_eq!(record.description, "Teaser aus der Liste");
        assert!(record.published_time.is_some());

        let warned: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.severity == Severity::Warning)
            .map(|e| e.category)
            .collect();
        assert!(warned.contains(&EventCategory::Field(FieldName::Title)));
        assert!(warned.contains(&EventCategory::Field(FieldName::Intro)));
        assert!(warned.contains(&EventCategory::Field(FieldName::Keywords)));
        assert!(!warned.contains(&EventCategory::Field(FieldName::ImageLinks)));
        assert!(!warned.contains(&EventCategory::Field(FieldName::PublishedTime)));
        assert!(!warned.contains(&EventCategory::Field(FieldName::Description)));
    }

    #[test]
    fn test_unparseable_date_warns_once() {
        let site = site();
        let sink = MemoryEventSink::new();
        let html = ARTICLE.replace("2019-11-21T10:50:00+0100", "gestern");
        let record = ArticlePipeline::new(&site, &sink)
            .process(&entry(), "https://glm.io/145123", &html)
            .unwrap();
        assert_eq!(record.published_time, None);
        assert_eq!(sink.count(EventCategory::Field(FieldName::PublishedTime)), 1);
    }

    #[test]
    fn test_credit_lines_become_authors() {
        let site = site();
        let sink = MemoryEventSink::new();
        let html = r#"<html><body><article>
            <p>Die Sonde bleibt am Boden.</p>
            <p>(bkl) (ase)</p>
            </article></body></html>"#;
        let record = ArticlePipeline::new(&site, &sink)
            .process(&entry(), "https://glm.io/145123", html)
            .unwrap();
        assert_eq!(record.text, "Die Sonde bleibt am Boden.");
        assert_eq!(record.authors, vec!["Bernd Klein", "Anna Seifert"]);
        assert_eq!(sink.count(EventCategory::Field(FieldName::Authors)), 0);
    }

    #[test]
    fn test_validator_drops_records_without_title_or_text() {
        let site = site();
        let sink = MemoryEventSink::new();
        let pipeline = ArticlePipeline::new(&site, &sink);
        let validator = Validator::new(&sink);

        let complete = pipeline.process(&entry(), "u1", ARTICLE).unwrap();
        assert!(validator.validate(complete.clone()).is_some());

        let mut no_text = complete.clone();
        no_text.text.clear();
        assert!(validator.validate(no_text).is_none());

        let mut no_title = complete;
        no_title.title.clear();
        assert!(validator.validate(no_title).is_none());

        assert_eq!(sink.count(EventCategory::MissingImportantProperty), 2);
    }
}
