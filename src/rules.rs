//! Per-site extraction rules.
//!
//! A rule set maps each record field to an ordered list of selectors plus an
//! evaluation mode. Rules are plain data loaded from the site configuration;
//! [`ExtractionRuleSet::compile`] turns them into [`CompiledRuleSet`]s that
//! the [`FieldExtractor`](crate::extract::FieldExtractor) evaluates.
//!
//! # Selector dialects
//!
//! Selectors are written either as CSS (as understood by `scraper`, with an
//! optional Scrapy-style `::text` / `::attr(name)` suffix) or as XPath. Only
//! the location-path subset found in news-site rule sets is accepted for
//! XPath, and it is translated to CSS when the rule set is compiled:
//!
//! ```text
//! //meta[@property="og:title"]/@content   ->  meta[property="og:title"]  + attr content
//! //*[@id="screen"]/div[2]/article         ->  *[id="screen"] > div:nth-of-type(2) > article
//! //ul[@class="month-inner"]//li/a/@href  ->  ul[class="month-inner"] li > a + attr href
//! ```

use crate::models::FieldName;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid CSS selector `{expr}`: {reason}")]
    InvalidCss { expr: String, reason: String },

    #[error("unsupported XPath `{expr}`: {reason}")]
    UnsupportedXPath { expr: String, reason: String },

    #[error("selector `{expr}` mixes text and attribute targets")]
    MixedTargets { expr: String },

    #[error("rule for `{field}` has no selectors")]
    EmptyRule { field: FieldName },
}

/// One selector, tagged with its dialect.
///
/// In YAML either `{ css: "..." }`, `{ xpath: "..." }` or a bare string,
/// which is read as CSS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSelectorSpec")]
pub enum SelectorSpec {
    Css(String),
    XPath(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelectorSpec {
    Bare(String),
    Tagged {
        css: Option<String>,
        xpath: Option<String>,
    },
}

impl TryFrom<RawSelectorSpec> for SelectorSpec {
    type Error = String;

    fn try_from(raw: RawSelectorSpec) -> Result<Self, Self::Error> {
        match raw {
            RawSelectorSpec::Bare(css) => Ok(SelectorSpec::Css(css)),
            RawSelectorSpec::Tagged {
                css: Some(css),
                xpath: None,
            } => Ok(SelectorSpec::Css(css)),
            RawSelectorSpec::Tagged {
                css: None,
                xpath: Some(xpath),
            } => Ok(SelectorSpec::XPath(xpath)),
            RawSelectorSpec::Tagged { .. } => {
                Err("a selector needs exactly one of `css` or `xpath`".to_string())
            }
        }
    }
}

impl SelectorSpec {
    pub fn expr(&self) -> &str {
        match self {
            SelectorSpec::Css(expr) | SelectorSpec::XPath(expr) => expr,
        }
    }

    pub fn compile(&self) -> Result<CompiledSelector, RuleError> {
        let (css, target) = match self {
            SelectorSpec::Css(expr) => split_css_target(expr)?,
            SelectorSpec::XPath(expr) => xpath_to_css(expr)?,
        };
        let selector = Selector::parse(&css).map_err(|e| RuleError::InvalidCss {
            expr: self.expr().to_string(),
            reason: e.to_string(),
        })?;
        Ok(CompiledSelector {
            spec: self.clone(),
            selector,
            target,
        })
    }
}

/// What a selector yields for each matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// All descendant text, concatenated.
    Text,
    /// The value of the named attribute; elements without it yield nothing.
    Attr(String),
}

#[derive(Debug, Clone)]
pub struct CompiledSelector {
    spec: SelectorSpec,
    selector: Selector,
    target: Target,
}

impl CompiledSelector {
    pub fn spec(&self) -> &SelectorSpec {
        &self.spec
    }

    /// Matched elements under `root`, in document order.
    pub fn elements<'a>(&'a self, root: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> + 'a {
        root.select(&self.selector)
    }

    /// Trimmed, non-empty values for every matched element, in document order.
    pub fn values(&self, root: ElementRef<'_>) -> Vec<String> {
        self.elements(root)
            .filter_map(|el| match &self.target {
                Target::Text => Some(el.text().collect::<String>()),
                Target::Attr(name) => el.value().attr(name).map(str::to_string),
            })
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }

    pub fn matches_any(&self, root: ElementRef<'_>) -> bool {
        self.elements(root).next().is_some()
    }
}

/// How the results of a rule's selectors are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    /// Selectors are tried in order; the first non-empty result wins.
    #[default]
    FirstMatch,
    /// All selectors contribute; values are deduplicated in first-seen order.
    UnionList,
    /// Every non-empty selector result is joined with the rule's separator.
    Joined,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionRule {
    pub field: FieldName,
    pub selectors: Vec<SelectorSpec>,
    #[serde(default)]
    pub mode: ExtractMode,
    /// Separator for [`ExtractMode::Joined`]; a single space when unset.
    #[serde(default)]
    pub separator: Option<String>,
    /// Split every value on this string (e.g. comma-separated keyword metas).
    #[serde(default)]
    pub split: Option<String>,
    /// Emit a warning event when the rule yields nothing.
    #[serde(default = "default_true")]
    pub warn_if_empty: bool,
}

/// The ordered rules for one site, as configured.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ExtractionRuleSet {
    pub rules: Vec<ExtractionRule>,
}

impl ExtractionRuleSet {
    pub fn compile(&self) -> Result<CompiledRuleSet, RuleError> {
        let mut rules = HashMap::new();
        for rule in &self.rules {
            if rule.selectors.is_empty() {
                return Err(RuleError::EmptyRule { field: rule.field });
            }
            let selectors = rule
                .selectors
                .iter()
                .map(SelectorSpec::compile)
                .collect::<Result<Vec<_>, _>>()?;
            rules.insert(
                rule.field,
                CompiledRule {
                    selectors,
                    mode: rule.mode,
                    separator: rule.separator.clone().unwrap_or_else(|| " ".to_string()),
                    split: rule.split.clone(),
                    warn_if_empty: rule.warn_if_empty,
                },
            );
        }
        Ok(CompiledRuleSet { rules })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub selectors: Vec<CompiledSelector>,
    pub mode: ExtractMode,
    pub separator: String,
    pub split: Option<String>,
    pub warn_if_empty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledRuleSet {
    rules: HashMap<FieldName, CompiledRule>,
}

impl CompiledRuleSet {
    pub fn get(&self, field: FieldName) -> Option<&CompiledRule> {
        self.rules.get(&field)
    }
}

static ATTR_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::attr\(\s*([A-Za-z_:][-A-Za-z0-9_:.]*)\s*\)\s*$").unwrap());

/// Split a CSS selector list into its selector part and a common target.
fn split_css_target(expr: &str) -> Result<(String, Target), RuleError> {
    let mut parts = Vec::new();
    let mut target: Option<Target> = None;
    for part in split_top_level(expr, ',') {
        let part = part.trim();
        let (css, part_target) = if let Some(css) = part.strip_suffix("::text") {
            (css.to_string(), Target::Text)
        } else if let Some(caps) = ATTR_SUFFIX.captures(part) {
            let whole = caps.get(0).map_or(0, |m| m.start());
            (part[..whole].to_string(), Target::Attr(caps[1].to_string()))
        } else {
            (part.to_string(), Target::Text)
        };
        match &target {
            Some(existing) if *existing != part_target => {
                return Err(RuleError::MixedTargets {
                    expr: expr.to_string(),
                })
            }
            _ => target = Some(part_target),
        }
        parts.push(css);
    }
    Ok((parts.join(", "), target.unwrap_or(Target::Text)))
}

/// Split on `sep` where it is not nested in brackets, parentheses or quotes.
fn split_top_level(expr: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' | '(' => depth += 1,
                ']' | ')' => depth -= 1,
                c if c == sep && depth == 0 => {
                    parts.push(&expr[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&expr[start..]);
    parts
}

/// Translate the supported XPath subset into a CSS selector list and target.
fn xpath_to_css(expr: &str) -> Result<(String, Target), RuleError> {
    let mut selectors = Vec::new();
    let mut target: Option<Target> = None;
    for branch in split_top_level(expr, '|') {
        let (css, branch_target) = xpath_path_to_css(expr, branch.trim())?;
        match &target {
            Some(existing) if *existing != branch_target => {
                return Err(RuleError::MixedTargets {
                    expr: expr.to_string(),
                })
            }
            _ => target = Some(branch_target),
        }
        selectors.push(css);
    }
    Ok((selectors.join(", "), target.unwrap_or(Target::Text)))
}

fn unsupported(expr: &str, reason: impl Into<String>) -> RuleError {
    RuleError::UnsupportedXPath {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn xpath_path_to_css(expr: &str, path: &str) -> Result<(String, Target), RuleError> {
    if !path.starts_with('/') {
        return Err(unsupported(expr, "only absolute location paths are supported"));
    }

    let mut css = String::new();
    let mut target = Target::Text;
    let mut rest = path;
    let mut first = true;

    while !rest.is_empty() {
        let descendant = rest.starts_with("//");
        rest = if descendant { &rest[2..] } else { &rest[1..] };
        let end = step_end(rest);
        let step = rest[..end].trim();
        rest = &rest[end..];

        if step.is_empty() {
            return Err(unsupported(expr, "empty location step"));
        }
        if let Some(attr) = step.strip_prefix('@') {
            if !rest.is_empty() {
                return Err(unsupported(expr, "attribute step must be last"));
            }
            target = Target::Attr(attr.to_string());
            break;
        }
        if step == "text()" {
            if !rest.is_empty() {
                return Err(unsupported(expr, "text() step must be last"));
            }
            break;
        }

        if !first {
            css.push_str(if descendant { " " } else { " > " });
        }
        css.push_str(&xpath_step_to_css(expr, step)?);
        first = false;
    }

    if css.is_empty() {
        return Err(unsupported(expr, "path selects no element"));
    }
    Ok((css, target))
}

/// Byte offset of the next `/` outside predicates.
fn step_end(rest: &str) -> usize {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in rest.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' => depth += 1,
                ']' => depth -= 1,
                '/' if depth == 0 => return i,
                _ => {}
            },
        }
    }
    rest.len()
}

static PRED_ATTR_EQ: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^@([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')$"#).unwrap()
});
static PRED_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^@([A-Za-z_:][-A-Za-z0-9_:.]*)$").unwrap());
static PRED_CONTAINS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^contains\(\s*@([A-Za-z_:][-A-Za-z0-9_:.]*)\s*,\s*(?:"([^"]*)"|'([^']*)')\s*\)$"#,
    )
    .unwrap()
});
static NODE_TEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\*|[A-Za-z][-A-Za-z0-9_]*)").unwrap());

fn xpath_step_to_css(expr: &str, step: &str) -> Result<String, RuleError> {
    let node = NODE_TEST
        .find(step)
        .ok_or_else(|| unsupported(expr, format!("unsupported node test in `{step}`")))?;
    let mut css = node.as_str().to_string();
    let mut rest = &step[node.end()..];

    while let Some(open) = rest.strip_prefix('[') {
        let close = predicate_end(open)
            .ok_or_else(|| unsupported(expr, format!("unbalanced predicate in `{step}`")))?;
        let predicate = open[..close].trim();
        rest = &open[close + 1..];
        css.push_str(&xpath_predicate_to_css(expr, predicate)?);
    }

    if !rest.trim().is_empty() {
        return Err(unsupported(expr, format!("unexpected `{rest}` in step")));
    }
    Ok(css)
}

fn predicate_end(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' => depth += 1,
                ']' if depth == 0 => return Some(i),
                ']' => depth -= 1,
                _ => {}
            },
        }
    }
    None
}

fn xpath_predicate_to_css(expr: &str, predicate: &str) -> Result<String, RuleError> {
    if let Some(caps) = PRED_ATTR_EQ.captures(predicate) {
        let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        return Ok(format!("[{}=\"{}\"]", &caps[1], css_escape(value)));
    }
    if let Some(caps) = PRED_CONTAINS.captures(predicate) {
        let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        return Ok(format!("[{}*=\"{}\"]", &caps[1], css_escape(value)));
    }
    if let Some(caps) = PRED_ATTR.captures(predicate) {
        return Ok(format!("[{}]", &caps[1]));
    }
    if let Ok(n) = predicate.parse::<usize>() {
        if n == 0 {
            return Err(unsupported(expr, "positions start at 1"));
        }
        return Ok(format!(":nth-of-type({n})"));
    }
    Err(unsupported(expr, format!("unsupported predicate `[{predicate}]`")))
}

fn css_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
