use std::sync::Arc;
use tracing::info;

pub mod browser;
pub mod extractor;
pub mod http_client;
pub mod rate_limiter;
pub mod retry;
pub mod session;

pub use extractor::{ExtractionMethod, ExtractionOutcome, Extractor, FieldMap, FieldRule, RawCandidate, Transform};
pub use rate_limiter::{ThrottleConfig, ThrottlePolicy};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use session::{MarkupSnapshot, RenderOptions, RenderingSession, SessionFactory, SessionGuard};

use crate::config::{SessionBackend, SessionSettings};
use crate::error::ScrapeResult;

/// Build the session factory for the configured backend
pub async fn session_factory(settings: &SessionSettings) -> ScrapeResult<Arc<dyn SessionFactory>> {
    info!("Using {} rendering backend", settings.backend);

    match settings.backend {
        SessionBackend::Http => Ok(Arc::new(http_client::HttpSessionFactory::new(settings)?)),
        SessionBackend::Browser => Ok(Arc::new(browser::BrowserSessionFactory::new(settings).await?)),
    }
}
