use super::{
    ClickReport, ClickTarget, ClickableGroup, ElementDescriptor, NavigationError,
    RenderedPageController, WaitCondition, click_groups,
};
use crate::normalize::normalize_whitespace;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use scraper::Html;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn render_err(e: impl std::fmt::Display) -> NavigationError {
    NavigationError::Render(e.to_string())
}

/// Headless Chromium controller for archives that expand groups via script.
pub struct BrowserPageController {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    poll_interval: Duration,
}

impl BrowserPageController {
    pub async fn launch(poll_interval: Duration) -> Result<Self, NavigationError> {
        let config = BrowserConfig::builder().build().map_err(render_err)?;
        let (browser, mut handler) = Browser::launch(config).await.map_err(render_err)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler stopped");
                    break;
                }
            }
        });
        let page = browser.new_page("about:blank").await.map_err(render_err)?;
        info!("Headless browser launched");
        Ok(Self {
            browser,
            page,
            handler,
            poll_interval,
        })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "Failed to close browser");
        }
        self.handler.abort();
    }
}

impl ClickableGroup for Element {
    async fn describe(&self, target: &ClickTarget) -> Result<ElementDescriptor, NavigationError> {
        let text_source = match &target.label {
            Some(label) => self.find_element(label.as_str()).await.ok(),
            None => None,
        };
        let text = match &text_source {
            Some(label) => label.inner_text().await,
            None => self.inner_text().await,
        }
        .map_err(render_err)?
        .unwrap_or_default();

        let mut attributes = BTreeMap::new();
        for name in ["href", "class", "id", "data-year", "data-month"] {
            if let Some(value) = self.attribute(name).await.map_err(render_err)? {
                attributes.insert(name.to_string(), value);
            }
        }
        if !attributes.contains_key("href") {
            if let Ok(anchor) = self.find_element("a[href]").await {
                if let Some(href) = anchor.attribute("href").await.map_err(render_err)? {
                    attributes.insert("href".to_string(), href);
                }
            }
        }
        Ok(ElementDescriptor {
            text: normalize_whitespace(&text),
            attributes,
        })
    }

    async fn click(self, target: &ClickTarget) -> Result<(), String> {
        let toggle = match &target.toggle {
            Some(css) => self
                .find_element(css.as_str())
                .await
                .map_err(|e| format!("no toggle: {e}"))?,
            None => self,
        };
        toggle
            .call_js_fn("function() { this.click(); }", false)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

impl Drop for BrowserPageController {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

impl RenderedPageController for BrowserPageController {
    async fn navigate(&mut self, url: &str) -> Result<(), NavigationError> {
        self.page.goto(url).await.map_err(render_err)?;
        self.page.wait_for_navigation().await.map_err(render_err)?;
        debug!(%url, "Browser navigated");
        Ok(())
    }

    async fn click_all(
        &mut self,
        target: &ClickTarget,
        predicate: &(dyn Fn(&ElementDescriptor) -> bool + Sync),
    ) -> Result<ClickReport, NavigationError> {
        let groups = match self.page.find_elements(target.group.as_str()).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(selector = %target.group, error = %e, "Group lookup failed");
                return Ok(ClickReport {
                    failures: vec![format!("{}: lookup failed: {e}", target.group)],
                    ..Default::default()
                });
            }
        };
        Ok(click_groups(groups, target, predicate).await)
    }

    async fn wait_until(
        &mut self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<bool, NavigationError> {
        let started = Instant::now();
        loop {
            let html = self.page.content().await.map_err(render_err)?;
            if condition.is_met(&Html::parse_document(&html)) {
                return Ok(true);
            }
            if started.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn snapshot(&mut self) -> Result<String, NavigationError> {
        self.page.content().await.map_err(render_err)
    }
}
