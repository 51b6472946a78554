use async_trait::async_trait;
#[cfg(feature = "browser")]
use chrono::Utc;
#[cfg(feature = "browser")]
use playwright::{
    api::{Browser, Page, Viewport},
    Playwright,
};
use std::time::Duration;
#[cfg(feature = "browser")]
use tracing::{debug, info};
use url::Url;

use crate::config::SessionSettings;
use crate::error::{ScrapeError, ScrapeResult};
#[cfg(feature = "browser")]
use crate::scraper::session::MarkupSnapshot;
use crate::scraper::session::{RenderOptions, RenderingSession, SessionFactory};

#[cfg(feature = "browser")]
const ENABLED_CONTROL_JS: &str = r#"sel => {
    const el = document.querySelector(sel);
    return !!el && !el.disabled
        && el.getAttribute('aria-disabled') !== 'true'
        && !el.classList.contains('disabled');
}"#;

#[cfg(feature = "browser")]
const CLICK_JS: &str = "sel => { const el = document.querySelector(sel); if (el) { el.click(); return true; } return false; }";

#[cfg(feature = "browser")]
const SCROLL_JS: &str = "() => window.scrollTo(0, document.body.scrollHeight)";

/// Opens headless Chromium sessions via Playwright
#[cfg(feature = "browser")]
pub struct BrowserSessionFactory {
    playwright: Playwright,
    settings: SessionSettings,
}

// Ensure BrowserSessionFactory is Send + Sync
#[cfg(feature = "browser")]
unsafe impl Send for BrowserSessionFactory {}
#[cfg(feature = "browser")]
unsafe impl Sync for BrowserSessionFactory {}

#[cfg(feature = "browser")]
impl BrowserSessionFactory {
    pub async fn new(settings: &SessionSettings) -> ScrapeResult<Self> {
        debug!("Initializing Playwright");

        let playwright = Playwright::initialize()
            .await
            .map_err(|e| ScrapeError::config(format!("failed to start Playwright: {}", e)))?;
        playwright
            .prepare()
            .map_err(|e| ScrapeError::config(format!("failed to install browsers: {}", e)))?;

        info!("Browser session factory initialized");
        Ok(Self {
            playwright,
            settings: settings.clone(),
        })
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl SessionFactory for BrowserSessionFactory {
    async fn open(&self, target_url: &Url, options: &RenderOptions) -> ScrapeResult<Box<dyn RenderingSession>> {
        debug!("Launching Chromium for {}", target_url);

        let browser = self
            .playwright
            .chromium()
            .launcher()
            .headless(self.settings.headless)
            .launch()
            .await
            .map_err(|e| ScrapeError::crashed(format!("browser launch failed: {}", e)))?;

        let context = browser
            .context_builder()
            .user_agent(&self.settings.user_agent)
            .viewport(Some(Viewport {
                width: self.settings.viewport_width,
                height: self.settings.viewport_height,
            }))
            .build()
            .await
            .map_err(|e| ScrapeError::crashed(format!("browser context failed: {}", e)))?;

        let page = context
            .new_page()
            .await
            .map_err(|e| ScrapeError::crashed(format!("page creation failed: {}", e)))?;

        Ok(Box::new(BrowserSession {
            browser,
            page,
            target: target_url.clone(),
            navigated: false,
            options: options.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "browser"
    }
}

/// One browser page driven through a catalog
#[cfg(feature = "browser")]
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    target: Url,
    navigated: bool,
    options: RenderOptions,
}

// Ensure BrowserSession is Send
#[cfg(feature = "browser")]
unsafe impl Send for BrowserSession {}

#[cfg(feature = "browser")]
impl BrowserSession {
    fn timeout_ms(&self) -> f64 {
        self.options.page_ready_timeout.as_millis() as f64
    }

    async fn navigate(&mut self) -> ScrapeResult<()> {
        let url = self.target.to_string();
        let timeout = self.options.page_ready_timeout;

        let goto = self.page.goto_builder(&url).timeout(self.timeout_ms()).goto();
        tokio::time::timeout(timeout, goto)
            .await
            .map_err(|_| ScrapeError::NavigationTimeout {
                url: url.clone(),
                timeout,
            })?
            .map_err(|e| classify_error(&url, timeout, &e.to_string()))?;

        self.navigated = true;
        Ok(())
    }

    async fn wait_until_ready(&self, url: &str) -> ScrapeResult<()> {
        let Some(ready) = self.options.ready_selector.as_deref() else {
            return Ok(());
        };
        let timeout = self.options.page_ready_timeout;

        self.page
            .wait_for_selector_builder(ready)
            .timeout(self.timeout_ms())
            .wait_for_selector()
            .await
            .map_err(|e| classify_error(url, timeout, &e.to_string()))?;
        Ok(())
    }

    /// One best-effort pass; a missing or unclickable overlay is expected
    async fn dismiss_consent(&self) {
        let Some(selector) = self.options.consent_overlay_selector.as_deref() else {
            return;
        };
        match self.page.evaluate::<String, bool>(CLICK_JS, selector.to_string()).await {
            Ok(true) => {
                debug!("Dismissed consent overlay");
                tokio::time::sleep(self.options.scroll_pause).await;
            }
            Ok(false) => debug!("No consent overlay present"),
            Err(e) => debug!("Consent overlay not dismissed: {}", e),
        }
    }

    async fn scroll(&self, url: &str) -> ScrapeResult<()> {
        for cycle in 0..self.options.scroll_cycles {
            self.page
                .evaluate::<(), ()>(SCROLL_JS, ())
                .await
                .map_err(|e| classify_error(url, self.options.page_ready_timeout, &e.to_string()))?;
            debug!("Scroll cycle {} complete", cycle + 1);
            tokio::time::sleep(self.options.scroll_pause).await;
        }
        Ok(())
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl RenderingSession for BrowserSession {
    async fn render_page(&mut self) -> ScrapeResult<MarkupSnapshot> {
        if !self.navigated {
            self.navigate().await?;
        }

        let url = self.page.url().unwrap_or_else(|_| self.target.to_string());
        self.wait_until_ready(&url).await?;
        self.dismiss_consent().await;
        self.scroll(&url).await?;

        let html = self
            .page
            .content()
            .await
            .map_err(|e| classify_error(&url, self.options.page_ready_timeout, &e.to_string()))?;

        Ok(MarkupSnapshot {
            url,
            html,
            rendered_at: Utc::now(),
        })
    }

    async fn advance_to_next_page(&mut self, next_page_selector: &str) -> ScrapeResult<bool> {
        let url = self.page.url().unwrap_or_else(|_| self.target.to_string());
        let timeout = self.options.page_ready_timeout;

        let enabled: bool = self
            .page
            .evaluate(ENABLED_CONTROL_JS, next_page_selector.to_string())
            .await
            .map_err(|e| classify_error(&url, timeout, &e.to_string()))?;
        if !enabled {
            return Ok(false);
        }

        let clicked: bool = self
            .page
            .evaluate(CLICK_JS, next_page_selector.to_string())
            .await
            .map_err(|e| classify_error(&url, timeout, &e.to_string()))?;
        if clicked {
            tokio::time::sleep(self.options.scroll_pause).await;
        }
        Ok(clicked)
    }

    async fn close(&mut self) -> ScrapeResult<()> {
        self.browser
            .close()
            .await
            .map_err(|e| ScrapeError::crashed(format!("browser close failed: {}", e)))
    }
}

/// Stub when the browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct BrowserSessionFactory;

#[cfg(not(feature = "browser"))]
impl BrowserSessionFactory {
    pub async fn new(_settings: &SessionSettings) -> ScrapeResult<Self> {
        Err(ScrapeError::config(
            "browser backend requires building with the `browser` feature",
        ))
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl SessionFactory for BrowserSessionFactory {
    async fn open(&self, _target_url: &Url, _options: &RenderOptions) -> ScrapeResult<Box<dyn RenderingSession>> {
        Err(ScrapeError::config("browser feature not enabled"))
    }

    fn name(&self) -> &'static str {
        "browser"
    }
}

/// Map a driver error message onto the run taxonomy
pub fn classify_error(url: &str, timeout: Duration, message: &str) -> ScrapeError {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ScrapeError::NavigationTimeout {
            url: url.to_string(),
            timeout,
        }
    } else if lower.contains("closed") || lower.contains("crash") || lower.contains("disconnected") {
        ScrapeError::crashed(message.to_string())
    } else {
        ScrapeError::NavigationFailed {
            url: url.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_error() {
        let timeout = Duration::from_secs(30);
        let url = "https://shop.example/catalog";

        assert!(matches!(
            classify_error(url, timeout, "Timeout 30000ms exceeded."),
            ScrapeError::NavigationTimeout { .. }
        ));
        assert!(classify_error(url, timeout, "Target page, context or browser has been closed").is_session_fatal());
        assert!(classify_error(url, timeout, "Browser crashed").is_session_fatal());

        let other = classify_error(url, timeout, "net::ERR_NAME_NOT_RESOLVED");
        assert!(matches!(other, ScrapeError::NavigationFailed { .. }));
        assert!(other.is_transient());
    }

    #[cfg(not(feature = "browser"))]
    #[tokio::test]
    async fn test_stub_factory_reports_configuration_error() {
        let result = BrowserSessionFactory::new(&SessionSettings::default()).await;
        assert!(matches!(result, Err(ScrapeError::Configuration { .. })));
    }
}
