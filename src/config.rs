//! Run and site configuration.
//!
//! Sites are described declaratively in a YAML file (see `config/sites.yaml`).
//! Every selector is compiled once at load; a site whose configuration does
//! not validate is reported and skipped while the other sites still run.

use crate::cli::Cli;
use crate::fetch::{RequestProfile, ShortUrlConfig, ShortUrlRule};
use crate::models::CrawlLimits;
use crate::navigator::{ArchiveConfig, ArchivePlan};
use crate::normalize::{DateChain, TextAssembler, TextAssembly};
use crate::rules::{CompiledRuleSet, CompiledSelector, ExtractionRuleSet, RuleError, SelectorSpec};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("site `{site}`: invalid root URL: {source}")]
    RootUrl {
        site: String,
        #[source]
        source: url::ParseError,
    },

    #[error("site `{site}`, {part}: {source}")]
    Rule {
        site: String,
        part: &'static str,
        #[source]
        source: RuleError,
    },

    #[error("site `{site}`: invalid short URL pattern: {source}")]
    ShortUrl {
        site: String,
        #[source]
        source: regex::Error,
    },
}

fn default_workers() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> usize {
    3
}

fn default_backoff_millis() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_backoff_millis")]
    pub backoff_millis: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            backoff_millis: default_backoff_millis(),
        }
    }
}

impl FetchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub limits: CrawlLimits,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

/// One site as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    pub root_url: String,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub request: RequestProfile,
    pub rules: ExtractionRuleSet,
    #[serde(default)]
    pub short_url: ShortUrlConfig,
    /// Presence of any of these on an article page marks it as paywalled.
    #[serde(default)]
    pub paywall_markers: Vec<SelectorSpec>,
    pub text: TextAssembly,
    /// Date formats tried in order against the page's time strings.
    #[serde(default)]
    pub dates: DateChain,
    /// Author code to full name, used when the page has no byline.
    #[serde(default)]
    pub author_codes: BTreeMap<String, String>,
    #[serde(default)]
    pub default_byline: Option<String>,
    #[serde(default)]
    pub keyword_stoplist: Vec<String>,
    /// Appended to article URLs when fetching, e.g. a single-page view.
    #[serde(default)]
    pub full_article_suffix: Option<String>,
}

/// A validated site, ready to crawl.
#[derive(Debug, Clone)]
pub struct Site {
    pub name: String,
    pub root: Url,
    pub archive: ArchivePlan,
    pub request: RequestProfile,
    pub rules: CompiledRuleSet,
    pub short_url: ShortUrlRule,
    pub paywall_markers: Vec<CompiledSelector>,
    pub text: TextAssembler,
    pub dates: DateChain,
    pub author_codes: BTreeMap<String, String>,
    pub default_byline: Option<String>,
    pub keyword_stoplist: BTreeSet<String>,
    pub full_article_suffix: Option<String>,
}

impl Site {
    /// URL actually requested for an article.
    pub fn request_url(&self, long_url: &str) -> String {
        match &self.full_article_suffix {
            Some(suffix) if !long_url.ends_with(suffix.as_str()) => format!("{long_url}{suffix}"),
            _ => long_url.to_string(),
        }
    }
}

impl SiteConfig {
    pub fn compile(&self) -> Result<Site, ConfigError> {
        let site = || self.name.clone();
        let rule_err = |part: &'static str| move |source| ConfigError::Rule {
            site: site(),
            part,
            source,
        };

        let root = Url::parse(&self.root_url).map_err(|source| ConfigError::RootUrl {
            site: site(),
            source,
        })?;
        let short_url = self
            .short_url
            .compile()
            .map_err(|source| ConfigError::ShortUrl {
                site: site(),
                source,
            })?;
        let paywall_markers = self
            .paywall_markers
            .iter()
            .map(SelectorSpec::compile)
            .collect::<Result<Vec<_>, _>>()
            .map_err(rule_err("paywall_markers"))?;

        Ok(Site {
            name: self.name.clone(),
            root,
            archive: self.archive.compile().map_err(rule_err("archive"))?,
            request: self.request.clone(),
            rules: self.rules.compile().map_err(rule_err("rules"))?,
            short_url,
            paywall_markers,
            text: self.text.compile().map_err(rule_err("text"))?,
            dates: self.dates.clone(),
            author_codes: self.author_codes.clone(),
            default_byline: self.default_byline.clone(),
            keyword_stoplist: self
                .keyword_stoplist
                .iter()
                .map(|k| k.trim().to_lowercase())
                .collect(),
            full_article_suffix: self.full_article_suffix.clone(),
        })
    }
}

impl CrawlerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// CLI values take precedence over the file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        let limits = &mut self.limits;
        if cli.max_articles.is_some() {
            limits.max_articles = cli.max_articles;
        }
        if cli.max_archive_units.is_some() {
            limits.max_archive_units = cli.max_archive_units;
        }
        if cli.target_year.is_some() {
            limits.target_year = cli.target_year;
        }
        if cli.min_month.is_some() {
            limits.min_month = cli.min_month;
        }
        if cli.time_budget_secs.is_some() {
            limits.time_budget_secs = cli.time_budget_secs;
        }
        self.workers = self.workers.max(1);
    }

    /// Compile the selected sites. Invalid sites are logged and left out.
    pub fn compile_sites(&self, only: &[String]) -> Vec<Site> {
        self.sites
            .iter()
            .filter(|s| only.is_empty() || only.iter().any(|name| *name == s.name))
            .filter_map(|s| match s.compile() {
                Ok(site) => Some(site),
                Err(e) => {
                    error!(site = %s.name, error = %e, "Invalid site configuration; skipping");
                    None
                }
            })
            .collect()
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<CrawlerConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config = CrawlerConfig::from_yaml(&content)?;
    info!(path = %path.display(), sites = config.sites.len(), "Loaded configuration");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const CONFIG: &str = r#"
workers: 4
fetch:
  retries: 1
limits:
  max_articles: 50
sites:
  - name: golem
    root_url: "https://www.golem.de/"
    archive:
      units:
        kind: monthly
        url_template: "https://www.golem.de/aa-{yy}{mm}.html"
      listing:
        container: "ol.list-articles"
        item: "li"
        link: "a"
    rules:
      - field: title
        selectors: ["h1 span.head5"]
    short_url:
      pattern: '-(\d+)\.html'
      template: "https://glm.io/{id}"
    text:
      container: "div.formatted"
      blocks: "p"
    dates:
      - format: "%Y-%m-%d %H:%M"
    full_article_suffix: "?page=all"
  - name: broken
    root_url: "https://broken.example/"
    archive:
      listing:
        container: "div[[["
        item: "a"
    rules: []
    text:
      container: "article"
      blocks: "p"
"#;

    #[test]
    fn test_parse_and_compile_valid_sites() {
        let config = CrawlerConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.fetch.retries, 1);
        assert_eq!(config.fetch.timeout_secs, 30);
        assert_eq!(config.limits.max_articles, Some(50));
        assert_eq!(config.sites.len(), 2);

        let sites = config.compile_sites(&[]);
        assert_eq!(sites.len(), 1);
        let golem = &sites[0];
        assert_eq!(golem.name, "golem");
        assert_eq!(
            golem.short_url.derive("https://www.golem.de/news/foo-1911-145123.html"),
            "https://glm.io/145123"
        );
        assert_eq!(
            golem.request_url("https://www.golem.de/news/foo-1911-145123.html"),
            "https://www.golem.de/news/foo-1911-145123.html?page=all"
        );
    }

    #[test]
    fn test_invalid_selector_names_site_and_part() {
        let config = CrawlerConfig::from_yaml(CONFIG).unwrap();
        let err = config.sites[1].compile().unwrap_err();
        match err {
            ConfigError::Rule { site, part, .. } => {
                assert_eq!(site, "broken");
                assert_eq!(part, "archive");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_site_filter() {
        let config = CrawlerConfig::from_yaml(CONFIG).unwrap();
        assert!(config.compile_sites(&["postillon".to_string()]).is_empty());
        assert_eq!(config.compile_sites(&["golem".to_string()]).len(), 1);
    }

    #[test]
    fn test_cli_overrides_file_limits() {
        let mut config = CrawlerConfig::from_yaml(CONFIG).unwrap();
        let cli = Cli::parse_from([
            "archive_crawler",
            "--config",
            "sites.yaml",
            "--workers",
            "2",
            "--max-articles",
            "5",
            "--target-year",
            "2019",
        ]);
        config.apply_cli(&cli);
        assert_eq!(config.workers, 2);
        assert_eq!(config.limits.max_articles, Some(5));
        assert_eq!(config.limits.target_year, Some(2019));
        assert_eq!(config.limits.min_month, None);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_config("/nonexistent/archive_crawler.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_sample_config_compiles() {
        let config = load_config(concat!(env!("CARGO_MANIFEST_DIR"), "/config/sites.yaml")).unwrap();
        let sites = config.compile_sites(&[]);
        assert_eq!(sites.len(), config.sites.len());
        assert!(sites.len() >= 3);
    }
}
