use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::ScrapeResult;

/// Fully rendered markup for one page
#[derive(Debug, Clone)]
pub struct MarkupSnapshot {
    pub url: String,
    pub html: String,
    pub rendered_at: DateTime<Utc>,
}

/// Per-session rendering behaviour
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Selector that must be present before the page counts as ready
    pub ready_selector: Option<String>,
    pub page_ready_timeout: Duration,
    pub consent_overlay_selector: Option<String>,
    pub scroll_cycles: u32,
    pub scroll_pause: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            ready_selector: None,
            page_ready_timeout: Duration::from_secs(30),
            consent_overlay_selector: None,
            scroll_cycles: 3,
            scroll_pause: Duration::from_millis(500),
        }
    }
}

/// A live page rendering session against one target.
///
/// Errors follow the run taxonomy: `NavigationTimeout`/`NavigationFailed` are
/// retryable, `PageRefused` skips the page, `SessionCrashed` means the session
/// must be reopened. Missing
/// optional elements (consent overlay, scroll target) are never errors.
#[async_trait]
pub trait RenderingSession: Send {
    /// Navigate if needed, wait for readiness, dismiss consent, scroll, and return the markup
    async fn render_page(&mut self) -> ScrapeResult<MarkupSnapshot>;

    /// Activate the next-page control. `Ok(false)` when no control is present.
    async fn advance_to_next_page(&mut self, next_page_selector: &str) -> ScrapeResult<bool>;

    async fn close(&mut self) -> ScrapeResult<()>;
}

/// Opens rendering sessions
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, target_url: &Url, options: &RenderOptions) -> ScrapeResult<Box<dyn RenderingSession>>;

    fn name(&self) -> &'static str;
}

/// Owns a session and closes it exactly once.
///
/// Callers run their page loop against `session()` and then call `release()`
/// on the single exit path. Dropping an unreleased guard is logged, since the
/// underlying resource can only be closed asynchronously.
pub struct SessionGuard {
    session: Option<Box<dyn RenderingSession>>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn RenderingSession>) -> Self {
        Self { session: Some(session) }
    }

    pub fn session(&mut self) -> Option<&mut (dyn RenderingSession + 'static)> {
        self.session.as_deref_mut()
    }

    /// Close the session, logging rather than propagating failures
    pub async fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => debug!("Rendering session closed"),
                Err(e) => warn!("Failed to close rendering session: {}", e),
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("Rendering session dropped without being closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSession {
        closes: Arc<AtomicUsize>,
        fail_close: bool,
    }

    #[async_trait]
    impl RenderingSession for CountingSession {
        async fn render_page(&mut self) -> ScrapeResult<MarkupSnapshot> {
            Ok(MarkupSnapshot {
                url: "https://shop.example".to_string(),
                html: "<html></html>".to_string(),
                rendered_at: Utc::now(),
            })
        }

        async fn advance_to_next_page(&mut self, _next_page_selector: &str) -> ScrapeResult<bool> {
            Ok(false)
        }

        async fn close(&mut self) -> ScrapeResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(crate::error::ScrapeError::crashed("already gone"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_guard_closes_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = SessionGuard::new(Box::new(CountingSession {
            closes: closes.clone(),
            fail_close: false,
        }));

        assert!(guard.session().is_some());
        guard.release().await;
        guard.release().await;

        assert!(guard.is_released());
        assert!(guard.session().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_failure_is_absorbed() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut guard = SessionGuard::new(Box::new(CountingSession {
            closes: closes.clone(),
            fail_close: true,
        }));

        guard.release().await;
        assert!(guard.is_released());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
