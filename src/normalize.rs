//! Value normalization shared by every site.
//!
//! - whitespace cleanup ([`normalize_whitespace`])
//! - date parsing with an ordered `(format, locale)` fallback chain ([`DateChain`])
//! - article text assembly from block-level nodes ([`TextAssembler`])
//! - author-code resolution for credit lines ([`resolve_authors`])
//! - URL canonicalization ([`absolutize`])

use crate::events::{EventCategory, EventSink};
use crate::models::FieldName;
use crate::rules::{CompiledSelector, RuleError, SelectorSpec};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use scraper::ElementRef;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r" ([,.!?;])").unwrap());

/// Collapse whitespace runs to one space, drop the space before `, . ! ? ;`
/// and trim. Idempotent.
pub fn normalize_whitespace(s: &str) -> String {
    let collapsed = WHITESPACE_RUN.replace_all(s, " ");
    let tightened = SPACE_BEFORE_PUNCT.replace_all(&collapsed, "$1");
    tightened.trim().to_string()
}

/// Locale of the month and weekday names in a date string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateLocale {
    #[default]
    En,
    De,
}

static GERMAN_NAMES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(Januar|Jänner|Februar|März|Mai|Juni|Juli|Oktober|Dezember|Mär|Okt|Dez|Montag|Dienstag|Mittwoch|Donnerstag|Freitag|Samstag|Sonnabend|Sonntag)\b",
    )
    .unwrap()
});

impl DateLocale {
    /// Rewrite localized month/weekday names to the English names chrono parses.
    fn to_english<'a>(&self, s: &'a str) -> std::borrow::Cow<'a, str> {
        match self {
            DateLocale::En => std::borrow::Cow::Borrowed(s),
            DateLocale::De => GERMAN_NAMES.replace_all(s, |caps: &Captures| {
                let english = match &caps[1] {
                    "Januar" | "Jänner" => "January",
                    "Februar" => "February",
                    "März" => "March",
                    "Mai" => "May",
                    "Juni" => "June",
                    "Juli" => "July",
                    "Oktober" => "October",
                    "Dezember" => "December",
                    "Mär" => "Mar",
                    "Okt" => "Oct",
                    "Dez" => "Dec",
                    "Montag" => "Monday",
                    "Dienstag" => "Tuesday",
                    "Mittwoch" => "Wednesday",
                    "Donnerstag" => "Thursday",
                    "Freitag" => "Friday",
                    "Samstag" | "Sonnabend" => "Saturday",
                    _ => "Sunday",
                };
                english.to_string()
            }),
        }
    }
}

/// One entry of a date fallback chain: a chrono `strftime` format, or
/// `rfc3339`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DateFormat {
    pub format: String,
    #[serde(default)]
    pub locale: DateLocale,
}

impl DateFormat {
    #[cfg(test)]
    pub fn new(format: &str, locale: DateLocale) -> Self {
        Self {
            format: format.to_string(),
            locale,
        }
    }

    /// Offset-aware inputs keep their wall-clock time; date-only formats
    /// resolve to midnight.
    pub fn parse(&self, input: &str) -> Option<NaiveDateTime> {
        let input = self.locale.to_english(input.trim());
        if self.format.eq_ignore_ascii_case("rfc3339") {
            return DateTime::parse_from_rfc3339(&input)
                .ok()
                .map(|dt| dt.naive_local());
        }
        DateTime::parse_from_str(&input, &self.format)
            .map(|dt| dt.naive_local())
            .or_else(|_| NaiveDateTime::parse_from_str(&input, &self.format))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(&input, &self.format)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    }
}

/// Ordered list of date formats tried against each candidate string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct DateChain {
    pub formats: Vec<DateFormat>,
}

impl DateChain {
    #[cfg(test)]
    pub fn new(formats: Vec<DateFormat>) -> Self {
        Self { formats }
    }

    pub fn parse_one(&self, input: &str) -> Option<NaiveDateTime> {
        if input.trim().is_empty() {
            return None;
        }
        self.formats.iter().find_map(|f| f.parse(input))
    }

    /// Try the whole chain against each candidate in turn (primary time,
    /// then modified time, then any further hint). When nothing parses,
    /// record exactly one `published_time` warning and yield `None`.
    ///
    /// # Arguments
    ///
    /// * `candidates` - Date strings in priority order; `None` entries are skipped
    /// * `site` - Site name for the warning event
    /// * `subject_url` - Article URL for the warning event
    /// * `sink` - Where the warning goes
    ///
    /// # Returns
    ///
    /// The first successful parse, or `None` when every candidate fails.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let chain = DateChain::new(vec![DateFormat::new("%d. %B %Y, %H:%M Uhr", DateLocale::De)]);
    /// let when = chain.resolve(&[Some("21. November 2019, 14:30 Uhr")], "golem", url, &sink);
    /// assert_eq!(when.unwrap().to_string(), "2019-11-21 14:30:00");
    /// ```
    pub fn resolve(
        &self,
        candidates: &[Option<&str>],
        site: &str,
        subject_url: &str,
        sink: &dyn EventSink,
    ) -> Option<NaiveDateTime> {
        let parsed = candidates
            .iter()
            .flatten()
            .find_map(|candidate| self.parse_one(candidate));
        if parsed.is_none() {
            debug!(site, url = subject_url, ?candidates, "No date format matched");
            sink.warning(site, subject_url, EventCategory::Field(FieldName::PublishedTime));
        }
        parsed
    }
}

fn default_separator() -> String {
    "\n\n".to_string()
}

/// How a site's article body is assembled.
#[derive(Debug, Clone, Deserialize)]
pub struct TextAssembly {
    /// Element(s) holding the article body.
    pub container: SelectorSpec,
    /// Block-level nodes inside the container, visited in document order.
    pub blocks: SelectorSpec,
    /// Broader element used when the primary container yields no text.
    #[serde(default)]
    pub fallback: Option<SelectorSpec>,
    /// Fallback text is cut at the first line containing this marker.
    #[serde(default)]
    pub see_also_marker: Option<String>,
    /// Drop trailing fallback lines that contain a known author code.
    #[serde(default)]
    pub strip_credits: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
}

/// Assembled body text plus the credit lines removed from its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledText {
    pub text: String,
    pub credits: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TextAssembler {
    container: CompiledSelector,
    blocks: CompiledSelector,
    fallback: Option<CompiledSelector>,
    see_also_marker: Option<String>,
    strip_credits: bool,
    separator: String,
}

impl TextAssembly {
    pub fn compile(&self) -> Result<TextAssembler, RuleError> {
        Ok(TextAssembler {
            container: self.container.compile()?,
            blocks: self.blocks.compile()?,
            fallback: self.fallback.as_ref().map(SelectorSpec::compile).transpose()?,
            see_also_marker: self.see_also_marker.clone(),
            strip_credits: self.strip_credits,
            separator: self.separator.clone(),
        })
    }
}

impl TextAssembler {
    pub fn assemble(
        &self,
        root: ElementRef<'_>,
        author_codes: &BTreeMap<String, String>,
    ) -> AssembledText {
        let paragraphs: Vec<String> = self
            .container
            .elements(root)
            .flat_map(|container| self.blocks.elements(container).collect::<Vec<_>>())
            .map(|block| normalize_whitespace(&visible_text(block)))
            .filter(|p| !p.is_empty())
            .collect();

        if !paragraphs.is_empty() {
            return AssembledText {
                text: paragraphs.join(&self.separator).trim().to_string(),
                credits: Vec::new(),
            };
        }

        let Some(fallback) = &self.fallback else {
            return AssembledText::default();
        };

        let mut lines: Vec<String> = fallback
            .elements(root)
            .flat_map(visible_lines)
            .collect();

        if let Some(marker) = &self.see_also_marker {
            if let Some(cut) = lines.iter().position(|l| l.contains(marker.as_str())) {
                lines.truncate(cut);
            }
        }

        let credits = if self.strip_credits {
            slice_off_credits(&mut lines, author_codes)
        } else {
            Vec::new()
        };

        AssembledText {
            text: lines.join(&self.separator).trim().to_string(),
            credits,
        }
    }
}

fn is_hidden(name: &str) -> bool {
    matches!(name, "script" | "style" | "noscript" | "template")
}

/// Text of `el`, skipping script/style content.
pub fn visible_text(el: ElementRef<'_>) -> String {
    visible_text_nodes(el).concat()
}

fn visible_text_nodes(el: ElementRef<'_>) -> Vec<String> {
    el.descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node
                .ancestors()
                .take_while(|a| a.id() != el.id())
                .chain(std::iter::once(*el))
                .filter_map(|a| a.value().as_element())
                .any(|e| is_hidden(e.name()));
            (!hidden).then(|| (**text).to_string())
        })
        .collect()
}

/// Non-empty normalized text nodes of `el`, one per line.
fn visible_lines(el: ElementRef<'_>) -> Vec<String> {
    visible_text_nodes(el)
        .iter()
        .map(|t| normalize_whitespace(t))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Remove trailing lines that contain any author code, returning them in
/// document order.
///
/// This is a positional heuristic: only the tail of the text is inspected
/// and a code matches as a plain substring, so short codes can collide with
/// ordinary words in a closing sentence.
pub fn slice_off_credits(lines: &mut Vec<String>, author_codes: &BTreeMap<String, String>) -> Vec<String> {
    let mut credits = Vec::new();
    while let Some(last) = lines.last() {
        if author_codes.keys().any(|code| last.contains(code.as_str())) {
            if let Some(line) = lines.pop() {
                credits.push(line);
            }
        } else {
            break;
        }
    }
    credits.reverse();
    credits
}

/// Map author codes found in credit fragments to full names, in order of
/// appearance. Falls back to the site's default byline.
pub fn resolve_authors(
    credits: &[String],
    author_codes: &BTreeMap<String, String>,
    default_byline: Option<&str>,
) -> Vec<String> {
    let mut found: Vec<(usize, usize, &str)> = Vec::new();
    for (line_no, line) in credits.iter().enumerate() {
        for (code, name) in author_codes {
            if let Some(pos) = line.find(code.as_str()) {
                found.push((line_no, pos, name.as_str()));
            }
        }
    }
    found.sort();
    let names: Vec<String> = found
        .into_iter()
        .map(|(_, _, name)| name.to_string())
        .unique()
        .collect();

    if names.is_empty() {
        default_byline
            .filter(|b| !b.trim().is_empty())
            .map(|b| vec![b.trim().to_string()])
            .unwrap_or_default()
    } else {
        names
    }
}

/// Resolve `href` against `base`, dropping fragments. Non-navigable schemes
/// (`javascript:`, `mailto:`, ...) yield `None`.
pub fn absolutize(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved.to_string())
}

/// Absolutize every value, dropping unusable ones and duplicates.
pub fn absolutize_all(base: &Url, hrefs: &[String]) -> Vec<String> {
    hrefs
        .iter()
        .filter_map(|h| absolutize(base, h))
        .unique()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCategory, MemoryEventSink};
    use proptest::prelude::*;
    use scraper::Html;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  Hallo \n\t Welt , wie geht's ?  "), "Hallo Welt, wie geht's?");
        assert_eq!(normalize_whitespace("a ; b . c !"), "a; b. c!");
        assert_eq!(normalize_whitespace(""), "");
    }

    proptest! {
        #[test]
        fn prop_normalize_whitespace_is_idempotent(s in "\\PC*") {
            let once = normalize_whitespace(&s);
            prop_assert_eq!(normalize_whitespace(&once), once.clone());
        }

        #[test]
        fn prop_normalize_idempotent_on_punctuation_heavy_input(s in "[ a,.!?;\t\n]{0,40}") {
            let once = normalize_whitespace(&s);
            prop_assert_eq!(normalize_whitespace(&once), once.clone());
        }
    }

    #[test]
    fn test_german_date_chain() {
        let chain = DateChain::new(vec![DateFormat::new("%d. %B %Y, %H:%M Uhr", DateLocale::De)]);
        let parsed = chain.parse_one("21. November 2019, 10:50 Uhr").unwrap();
        assert_eq!(parsed.to_string(), "2019-11-21 10:50:00");

        let march = chain.parse_one("3. März 2020, 08:15 Uhr").unwrap();
        assert_eq!(march.to_string(), "2020-03-03 08:15:00");
    }

    #[test]
    fn test_unparsable_date_yields_unknown_and_one_warning() {
        let chain = DateChain::new(vec![
            DateFormat::new("%d. %B %Y, %H:%M Uhr", DateLocale::De),
            DateFormat::new("%Y-%m-%d %H:%M:%S", DateLocale::En),
        ]);
        let sink = MemoryEventSink::new();
        let parsed = chain.resolve(&[Some("not-a-date")], "golem", "https://glm.io/1", &sink);
        assert!(parsed.is_none());
        assert_eq!(sink.events().len(), 1);
        assert_eq!(
            sink.count(EventCategory::Field(FieldName::PublishedTime)),
            1
        );
    }

    #[test]
    fn test_resolve_skips_missing_candidates() {
        let chain = DateChain::new(vec![DateFormat::new("%d. %B %Y, %H:%M Uhr", DateLocale::De)]);
        let sink = MemoryEventSink::new();
        let parsed = chain
            .resolve(
                &[None, Some("21. November 2019, 14:30 Uhr")],
                "golem",
                "https://glm.io/145123",
                &sink,
            )
            .unwrap();
        assert_eq!(parsed.to_string(), "2019-11-21 14:30:00");
        assert!(sink.events().is_empty());

        assert!(chain.resolve(&[None, None], "golem", "https://glm.io/145123", &sink).is_none());
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_date_chain_falls_back_to_modified_time() {
        let chain = DateChain::new(vec![
            DateFormat::new("%Y-%m-%dT%H:%M:%S%z", DateLocale::En),
            DateFormat::new("%Y-%m-%dT%H:%M:%S", DateLocale::En),
        ]);
        let sink = MemoryEventSink::new();
        let parsed = chain
            .resolve(
                &[Some("gestern"), Some("2019-11-14T10:50:00+01:00")],
                "postillon",
                "u",
                &sink,
            )
            .unwrap();
        assert_eq!(parsed.to_string(), "2019-11-14 10:50:00");
        assert!(sink.events().is_empty());

        let naive = chain.parse_one("2019-11-14T10:50:00").unwrap();
        assert_eq!(naive.to_string(), "2019-11-14 10:50:00");
    }

    #[test]
    fn test_date_only_and_rfc3339() {
        let date_only = DateChain::new(vec![DateFormat::new("%d.%m.%Y", DateLocale::De)]);
        assert_eq!(
            date_only.parse_one("05.12.2019").unwrap().to_string(),
            "2019-12-05 00:00:00"
        );
        let rfc = DateChain::new(vec![DateFormat::new("rfc3339", DateLocale::En)]);
        assert_eq!(
            rfc.parse_one("2020-01-02T03:04:05+01:00").unwrap().to_string(),
            "2020-01-02 03:04:05"
        );
        assert!(rfc.parse_one("   ").is_none());
    }

    fn assembly(yaml: &str) -> TextAssembler {
        serde_yaml::from_str::<TextAssembly>(yaml)
            .unwrap()
            .compile()
            .unwrap()
    }

    #[test]
    fn test_text_assembly_walks_blocks_in_order() {
        let assembler = assembly(
            r#"
container: "article"
blocks: "p.article, h6"
"#,
        );
        let html = Html::parse_document(
            r#"<article>
                 <p class="article">Erster   Absatz .</p>
                 <script>var x = 1;</script>
                 <h6>Zwischentitel</h6>
                 <p class="other">ignoriert</p>
                 <p class="article">Zweiter <a href="/x">Absatz</a><style>.a{}</style></p>
               </article>"#,
        );
        let assembled = assembler.assemble(html.root_element(), &BTreeMap::new());
        assert_eq!(
            assembled.text,
            "Erster Absatz.\n\nZwischentitel\n\nZweiter Absatz"
        );
        assert!(assembled.credits.is_empty());
    }

    #[test]
    fn test_text_assembly_fallback_with_marker_and_credits() {
        let assembler = assembly(
            r#"
container: "div.missing"
blocks: "p"
fallback: "div.post-body"
see_also_marker: "Lesen Sie auch"
strip_credits: true
separator: "\n"
"#,
        );
        let html = Html::parse_document(
            r#"<div class="post-body">
                 Satire ist wichtig.<br>
                 Noch ein Satz.<br>
                 ssi, dan; Foto: Shutterstock<br>
                 Lesen Sie auch<br>
                 Anderer Artikel
               </div>"#,
        );
        let mut codes = BTreeMap::new();
        codes.insert("ssi".to_string(), "Stefan Sichermann".to_string());
        codes.insert("dan".to_string(), "Daniel Sonntag".to_string());

        let assembled = assembler.assemble(html.root_element(), &codes);
        assert_eq!(assembled.text, "Satire ist wichtig.\nNoch ein Satz.");
        assert_eq!(assembled.credits, vec!["ssi, dan; Foto: Shutterstock".to_string()]);
    }

    #[test]
    fn test_slice_off_credits_substring_contract() {
        let mut codes = BTreeMap::new();
        codes.insert("pfg".to_string(), "Peter Fröhlich".to_string());
        let mut lines = vec![
            "Absatz eins".to_string(),
            "pfg; Foto: dpa".to_string(),
            "(pfg)".to_string(),
        ];
        let credits = slice_off_credits(&mut lines, &codes);
        assert_eq!(lines, vec!["Absatz eins".to_string()]);
        assert_eq!(credits, vec!["pfg; Foto: dpa".to_string(), "(pfg)".to_string()]);

        let mut untouched = vec!["pfg steht vorne".to_string(), "Ende".to_string()];
        assert!(slice_off_credits(&mut untouched, &codes).is_empty());
        assert_eq!(untouched.len(), 2);
    }

    #[test]
    fn test_resolve_authors() {
        let mut codes = BTreeMap::new();
        codes.insert("ssi".to_string(), "Stefan Sichermann".to_string());
        codes.insert("dan".to_string(), "Daniel Sonntag".to_string());

        let credits = vec!["dan, ssi; Foto: Shutterstock".to_string()];
        assert_eq!(
            resolve_authors(&credits, &codes, Some("Der Postillon")),
            vec!["Daniel Sonntag".to_string(), "Stefan Sichermann".to_string()]
        );
        assert_eq!(
            resolve_authors(&["Foto: dpa".to_string()], &codes, Some("Der Postillon")),
            vec!["Der Postillon".to_string()]
        );
        assert!(resolve_authors(&[], &codes, None).is_empty());
    }

    #[test]
    fn test_absolutize() {
        let base = Url::parse("https://taz.de/").unwrap();
        assert_eq!(
            absolutize(&base, "/Politik/!5641234/#comments").as_deref(),
            Some("https://taz.de/Politik/!5641234/")
        );
        assert_eq!(
            absolutize(&base, "https://glm.io/1").as_deref(),
            Some("https://glm.io/1")
        );
        assert_eq!(absolutize(&base, "javascript:void(0)"), None);
        assert_eq!(absolutize(&base, "mailto:a@b.de"), None);
        assert_eq!(absolutize(&base, "  "), None);

        let all = absolutize_all(
            &base,
            &["/a".to_string(), "https://taz.de/a".to_string(), "#top".to_string()],
        );
        assert_eq!(all, vec!["https://taz.de/a".to_string(), "https://taz.de/".to_string()]);
    }
}
