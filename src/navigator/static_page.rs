use super::{
    ClickReport, ClickTarget, ElementDescriptor, NavigationError, RenderedPageController,
    WaitCondition, describe_groups,
};
use crate::fetch::PageFetcher;
use scraper::Html;
use std::time::Duration;
use tracing::debug;

/// Controller over plain HTTP responses.
///
/// Archives that only reveal links after script-driven clicks need the
/// browser backend; here every matching click is reported as a failure so
/// traversal carries on with whatever the initial HTML holds.
pub struct StaticPageController<F> {
    fetcher: F,
    current: Option<String>,
}

impl<F: PageFetcher> StaticPageController<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            current: None,
        }
    }

    fn page(&self) -> Result<&str, NavigationError> {
        self.current.as_deref().ok_or(NavigationError::NoPage)
    }
}

impl<F: PageFetcher> RenderedPageController for StaticPageController<F> {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        let html = self
            .fetcher
            .fetch(url)
            .await
            .map_err(|source| NavigationError::Load {
                url: url.to_string(),
                source,
            })?;
        debug!(%url, bytes = html.len(), "Loaded archive page");
        self.current = Some(html);
        Ok(())
    }

    async fn click_all(
        &mut self,
        target: &ClickTarget,
        predicate: &(dyn Fn(&ElementDescriptor) -> bool + Sync),
    ) -> Result<ClickReport, NavigationError> {
        let html = Html::parse_document(self.page()?);
        let matched = describe_groups(&html, target)?
            .into_iter()
            .filter(|d| predicate(d))
            .count();
        Ok(ClickReport {
            matched,
            clicked: 0,
            failures: vec!["static snapshot cannot execute clicks".to_string(); matched],
        })
    }

    async fn wait_until(
        &mut self,
        condition: &WaitCondition,
        _timeout: Duration,
    ) -> Result<bool, NavigationError> {
        // Nothing changes between polls of a static page.
        Ok(condition.is_met(&Html::parse_document(self.page()?)))
    }

    async fn snapshot(&mut self) -> Result<String, NavigationError> {
        self.page().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchFailure;
    use std::collections::HashMap;

    struct MapFetcher(HashMap<&'static str, &'static str>);

    impl PageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<String, FetchFailure> {
            self.0
                .get(url)
                .map(|s| s.to_string())
                .ok_or(FetchFailure::HttpError(404))
        }
    }

    const PAGE: &str = r#"<html><body>
        <li class="closed"><a href="/2019/11/">November 2019</a></li>
        <li class="closed"><a href="/2019/10/">Oktober 2019</a></li>
        <ul class="posts"></ul></body></html>"#;

    fn controller() -> StaticPageController<MapFetcher> {
        StaticPageController::new(MapFetcher(HashMap::from([("https://blog.example/", PAGE)])))
    }

    #[tokio::test]
    async fn test_clicks_are_reported_as_failures() {
        let mut c = controller();
        c.navigate("https://blog.example/").await.unwrap();
        let target = ClickTarget {
            group: "li.closed".to_string(),
            toggle: None,
            label: None,
        };
        let report = c
            .click_all(&target, &|d| d.text.starts_with("Nov"))
            .await
            .unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.clicked, 0);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_and_snapshot() {
        let mut c = controller();
        assert!(matches!(c.snapshot().await, Err(NavigationError::NoPage)));
        c.navigate("https://blog.example/").await.unwrap();

        let present = WaitCondition {
            selectors: vec!["ul.posts".to_string()],
        };
        let absent = WaitCondition {
            selectors: vec!["ul.posts li".to_string()],
        };
        assert!(c.wait_until(&present, Duration::from_secs(1)).await.unwrap());
        assert!(!c.wait_until(&absent, Duration::from_secs(1)).await.unwrap());
        assert!(c.snapshot().await.unwrap().contains("Oktober 2019"));
    }

    #[tokio::test]
    async fn test_failed_load_carries_fetch_failure() {
        let mut c = controller();
        let err = c.navigate("https://blog.example/missing").await.unwrap_err();
        assert!(matches!(
            err,
            NavigationError::Load {
                source: FetchFailure::HttpError(404),
                ..
            }
        ));
    }
}
