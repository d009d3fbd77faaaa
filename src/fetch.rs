//! Article fetching with per-site request profiles.
//!
//! # Architecture
//!
//! - [`PageFetcher`]: core trait, fetch one URL and return the page body
//! - [`HttpFetcher`]: `reqwest` implementation configured from a [`RequestProfile`]
//! - [`RetryFetch`]: decorator that retries transient failures with
//!   exponential backoff and jitter
//!
//! Consent and paywall walls are only recognisable once the page is parsed,
//! so [`FetchFailure::Blocked`] is produced by the article pipeline rather
//! than here.

use once_cell::sync::Lazy;
use rand::{Rng, rng};
use regex::Regex;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, instrument, warn};
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    HttpError(u16),

    #[error("blocked by a consent or paywall marker")]
    Blocked,
}

impl FetchFailure {
    /// Network errors and server-side statuses are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchFailure::Network(_) => true,
            FetchFailure::HttpError(status) => *status == 429 || *status >= 500,
            FetchFailure::Blocked => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("invalid header name `{0}`")]
    HeaderName(String),

    #[error("invalid value for header `{0}`")]
    HeaderValue(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Headers, cookies and user agent sent with every request to one site.
/// Cookies are typically pre-accepted consent tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestProfile {
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

impl RequestProfile {
    /// `name=value` pairs joined for a `Cookie` header.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn header_map(&self) -> Result<HeaderMap, ProfileError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProfileError::HeaderName(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| ProfileError::HeaderValue(name.clone()))?;
            headers.insert(header, value);
        }
        if let Some(cookie) = self.cookie_header() {
            let value =
                HeaderValue::from_str(&cookie).map_err(|_| ProfileError::HeaderValue("cookie".into()))?;
            headers.insert(COOKIE, value);
        }
        Ok(headers)
    }
}

/// Fetches a page body.
pub trait PageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchFailure>;
}

/// `reqwest`-backed fetcher bound to one site's [`RequestProfile`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(profile: &RequestProfile, timeout: Duration) -> Result<Self, ProfileError> {
        let mut builder = reqwest::Client::builder()
            .default_headers(profile.header_map()?)
            .timeout(timeout);
        if let Some(ua) = &profile.user_agent {
            builder = builder.user_agent(ua.as_str());
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

impl PageFetcher for HttpFetcher {
    #[instrument(level = "info", skip_all, fields(%url))]
    async fn fetch(&self, url: &str) -> Result<String, FetchFailure> {
        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Non-success response");
            return Err(FetchFailure::HttpError(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::Network(e.to_string()))?;
        debug!(
            bytes = body.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched page"
        );
        Ok(body)
    }
}

/// Wraps any [`PageFetcher`] with retries for transient failures.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
#[derive(Clone)]
pub struct RetryFetch<T> {
    inner: T,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: PageFetcher> RetryFetch<T> {
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T: PageFetcher> PageFetcher for RetryFetch<T> {
    async fn fetch(&self, url: &str) -> Result<String, FetchFailure> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.fetch(url).await {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        error!(
                            %url,
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                            error = %e,
                            "fetch exhausted retries"
                        );
                        return Err(e);
                    }

                    let shift = (attempt - 1).min(16) as u32;
                    let delay = self
                        .base_delay
                        .saturating_mul(1 << shift)
                        .min(self.max_delay);
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + Duration::from_millis(jitter_ms);

                    warn!(
                        %url,
                        attempt,
                        max = self.max_retries,
                        ?delay,
                        error = %e,
                        "fetch attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

static DEFAULT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\.html").unwrap());

fn default_id_pattern() -> String {
    DEFAULT_ID_PATTERN.as_str().to_string()
}

/// Configuration for deriving a site's canonical short URL.
#[derive(Debug, Clone, Deserialize)]
pub struct ShortUrlConfig {
    /// Regex whose first capture group is the article id. The last match in
    /// the long URL wins.
    #[serde(default = "default_id_pattern")]
    pub pattern: String,
    /// Short URL template with an `{id}` placeholder; when unset the id is
    /// appended to the long URL's origin.
    #[serde(default)]
    pub template: Option<String>,
}

impl Default for ShortUrlConfig {
    fn default() -> Self {
        Self {
            pattern: default_id_pattern(),
            template: None,
        }
    }
}

impl ShortUrlConfig {
    pub fn compile(&self) -> Result<ShortUrlRule, regex::Error> {
        Ok(ShortUrlRule {
            pattern: Regex::new(&self.pattern)?,
            template: self.template.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShortUrlRule {
    pattern: Regex,
    template: Option<String>,
}

#[cfg(test)]
impl Default for ShortUrlRule {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_ID_PATTERN.clone(),
            template: None,
        }
    }
}

impl ShortUrlRule {
    /// Canonical short form of `long_url`, or `long_url` itself when it
    /// carries no article id.
    ///
    /// # Arguments
    ///
    /// * `long_url` - The article URL as linked from the archive
    ///
    /// # Returns
    ///
    /// The template with `{id}` replaced by the last id match, or the long
    /// URL's origin followed by the id when no template is configured.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let rule = ShortUrlConfig { template: Some("https://glm.io/{id}".into()), ..Default::default() }.compile()?;
    /// assert_eq!(rule.derive("https://www.golem.de/news/foo-1911-145123.html"), "https://glm.io/145123");
    /// assert_eq!(rule.derive("https://www.golem.de/specials/"), "https://www.golem.de/specials/");
    /// ```
    pub fn derive(&self, long_url: &str) -> String {
        let id = self
            .pattern
            .captures_iter(long_url)
            .last()
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());

        let Some(id) = id else {
            return long_url.to_string();
        };

        match &self.template {
            Some(template) => template.replace("{id}", &id),
            None => match Url::parse(long_url) {
                Ok(url) => format!("{}/{}", url.origin().ascii_serialization(), id),
                Err(_) => long_url.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_short_url_with_template() {
        let rule = ShortUrlConfig {
            template: Some("https://glm.io/{id}".to_string()),
            ..Default::default()
        }
        .compile()
        .unwrap();
        assert_eq!(
            rule.derive("https://www.golem.de/news/raumfahrt-start-verschoben-1911-145112.html"),
            "https://glm.io/145112"
        );
    }

    #[test]
    fn test_short_url_uses_last_digit_run() {
        let rule = ShortUrlRule::default();
        assert_eq!(
            rule.derive("https://www.example.com/2019/11/story-2011-151234.html"),
            "https://www.example.com/151234"
        );
    }

    #[test]
    fn test_short_url_without_id_echoes_long_url() {
        let rule = ShortUrlRule::default();
        let long = "https://www.der-postillon.com/p/das-postillon-archiv.html";
        assert_eq!(rule.derive(long), long);
        assert_eq!(rule.derive("https://example.com/story"), "https://example.com/story");
    }

    #[test]
    fn test_short_url_custom_pattern() {
        let rule = ShortUrlConfig {
            pattern: r"(\d(?:\.|\d)+)$".to_string(),
            template: Some("https://sz.de/{id}".to_string()),
        }
        .compile()
        .unwrap();
        assert_eq!(
            rule.derive("https://www.sueddeutsche.de/politik/wahl-1.4692342"),
            "https://sz.de/1.4692342"
        );
    }

    #[test]
    fn test_request_profile_headers() {
        let mut profile = RequestProfile::default();
        profile
            .cookies
            .insert("golem_consent20".to_string(), "cmp|200801".to_string());
        profile
            .cookies
            .insert("iom_consent".to_string(), "010fff".to_string());
        profile
            .headers
            .insert("Accept-Language".to_string(), "de-DE".to_string());

        assert_eq!(
            profile.cookie_header().as_deref(),
            Some("golem_consent20=cmp|200801; iom_consent=010fff")
        );
        let headers = profile.header_map().unwrap();
        assert_eq!(headers.get("accept-language").unwrap(), "de-DE");
        assert!(headers.get(COOKIE).is_some());

        profile.headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(profile.header_map(), Err(ProfileError::HeaderName(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchFailure::Network("reset".into()).is_transient());
        assert!(FetchFailure::HttpError(503).is_transient());
        assert!(FetchFailure::HttpError(429).is_transient());
        assert!(!FetchFailure::HttpError(404).is_transient());
        assert!(!FetchFailure::Blocked.is_transient());
    }

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        failure: FetchFailure,
    }

    impl PageFetcher for Flaky {
        async fn fetch(&self, _url: &str) -> Result<String, FetchFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.failure.clone())
            } else {
                Ok("<html></html>".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let fetcher = RetryFetch::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 2,
                failure: FetchFailure::HttpError(502),
            },
            3,
            Duration::from_millis(1),
        );
        assert_eq!(fetcher.fetch("https://x").await.unwrap(), "<html></html>");
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_client_errors() {
        let fetcher = RetryFetch::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 5,
                failure: FetchFailure::HttpError(404),
            },
            3,
            Duration::from_millis(1),
        );
        assert_eq!(
            fetcher.fetch("https://x").await.unwrap_err(),
            FetchFailure::HttpError(404)
        );
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let fetcher = RetryFetch::new(
            Flaky {
                calls: AtomicUsize::new(0),
                failures: 10,
                failure: FetchFailure::Network("timeout".into()),
            },
            2,
            Duration::from_millis(1),
        );
        assert!(fetcher.fetch("https://x").await.is_err());
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }
}
