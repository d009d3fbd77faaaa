//! Evaluation of compiled extraction rules against a parsed page.

use crate::models::FieldName;
use crate::rules::{CompiledRule, CompiledRuleSet, ExtractMode};
use itertools::Itertools;
use scraper::ElementRef;

/// Evaluates one site's rules. Borrows the rule set owned by the site
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct FieldExtractor<'a> {
    rules: &'a CompiledRuleSet,
}

impl<'a> FieldExtractor<'a> {
    pub fn new(rules: &'a CompiledRuleSet) -> Self {
        Self { rules }
    }

    pub fn rule(&self, field: FieldName) -> Option<&'a CompiledRule> {
        self.rules.get(field)
    }

    /// All values the rule for `field` yields, combined per the rule's mode.
    /// A field without a rule yields nothing.
    pub fn list(&self, field: FieldName, root: ElementRef<'_>) -> Vec<String> {
        match self.rules.get(field) {
            Some(rule) => evaluate(rule, root),
            None => Vec::new(),
        }
    }

    /// The rule's values joined by a single space.
    pub fn scalar(&self, field: FieldName, root: ElementRef<'_>) -> String {
        self.list(field, root).join(" ")
    }
}

fn selector_values(rule: &CompiledRule, index: usize, root: ElementRef<'_>) -> Vec<String> {
    let values = rule.selectors[index].values(root);
    match &rule.split {
        Some(sep) => values
            .iter()
            .flat_map(|v| v.split(sep.as_str()))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
        None => values,
    }
}

fn evaluate(rule: &CompiledRule, root: ElementRef<'_>) -> Vec<String> {
    let per_selector = (0..rule.selectors.len()).map(|i| selector_values(rule, i, root));
    match rule.mode {
        ExtractMode::FirstMatch => per_selector
            .into_iter()
            .find(|values| !values.is_empty())
            .unwrap_or_default(),
        ExtractMode::UnionList => per_selector.flatten().unique().collect(),
        ExtractMode::Joined => {
            let joined = per_selector
                .map(|values| values.join(" "))
                .filter(|v| !v.is_empty())
                .join(&rule.separator);
            if joined.is_empty() {
                Vec::new()
            } else {
                vec![joined]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ExtractionRuleSet;
    use scraper::Html;

    const PAGE: &str = r#"<html><head>
        <meta name="empty" content="">
        <meta name="keywords" content="Politik, Bayern ,Politik">
        </head><body>
        <h1><span class="kicker">Raumfahrt</span><span class="title">Start verschoben</span></h1>
        <p class="greeting">Hello</p>
        <ul class="one"><li>a</li><li>b</li></ul>
        <ul class="two"><li>b</li><li>c</li></ul>
        </body></html>"#;

    fn rules(yaml: &str) -> crate::rules::CompiledRuleSet {
        serde_yaml::from_str::<ExtractionRuleSet>(yaml)
            .unwrap()
            .compile()
            .unwrap()
    }

    #[test]
    fn test_first_match_skips_empty_selector() {
        let rules = rules(
            r#"
- field: title
  selectors:
    - "meta[name=empty]::attr(content)"
    - "p.greeting"
"#,
        );
        let html = Html::parse_document(PAGE);
        let extractor = FieldExtractor::new(&rules);
        assert_eq!(extractor.scalar(FieldName::Title, html.root_element()), "Hello");
    }

    #[test]
    fn test_union_list_dedups_in_first_seen_order() {
        let rules = rules(
            r#"
- field: links
  mode: union_list
  selectors:
    - "ul.one li"
    - "ul.two li"
"#,
        );
        let html = Html::parse_document(PAGE);
        let extractor = FieldExtractor::new(&rules);
        assert_eq!(
            extractor.list(FieldName::Links, html.root_element()),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_joined_mode_concatenates_headline_parts() {
        let rules = rules(
            r#"
- field: title
  mode: joined
  separator: ": "
  selectors:
    - "h1 span.kicker"
    - "h1 span.missing"
    - "h1 span.title"
"#,
        );
        let html = Html::parse_document(PAGE);
        let extractor = FieldExtractor::new(&rules);
        assert_eq!(
            extractor.scalar(FieldName::Title, html.root_element()),
            "Raumfahrt: Start verschoben"
        );
    }

    #[test]
    fn test_split_values() {
        let rules = rules(
            r#"
- field: keywords
  mode: union_list
  split: ","
  selectors:
    - "meta[name=keywords]::attr(content)"
"#,
        );
        let html = Html::parse_document(PAGE);
        let extractor = FieldExtractor::new(&rules);
        assert_eq!(
            extractor.list(FieldName::Keywords, html.root_element()),
            vec!["Politik", "Bayern"]
        );
    }

    #[test]
    fn test_missing_rule_and_exhausted_fallbacks_are_empty() {
        let rules = rules(
            r#"
- field: intro
  selectors:
    - "p.nope"
    - "div.nope"
"#,
        );
        let html = Html::parse_document(PAGE);
        let extractor = FieldExtractor::new(&rules);
        assert!(extractor.list(FieldName::Intro, html.root_element()).is_empty());
        assert_eq!(extractor.scalar(FieldName::Authors, html.root_element()), "");
        assert!(extractor.rule(FieldName::Intro).is_some());
    }
}
