use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client, StatusCode,
};
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::SessionSettings;
use crate::error::{ScrapeError, ScrapeResult};
use crate::scraper::extractor::is_disabled;
use crate::scraper::session::{MarkupSnapshot, RenderOptions, RenderingSession, SessionFactory};

/// Opens sessions that fetch server-rendered markup over HTTP
pub struct HttpSessionFactory {
    client: Client,
}

impl HttpSessionFactory {
    pub fn new(settings: &SessionSettings) -> ScrapeResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert("Accept-Language", HeaderValue::from_static("de-DE,de;q=0.9,en;q=0.8"));
        headers.insert("DNT", HeaderValue::from_static("1"));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ScrapeError::config(format!("failed to build HTTP client: {}", e)))?;

        info!("HTTP session factory initialized");
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open(&self, target_url: &Url, options: &RenderOptions) -> ScrapeResult<Box<dyn RenderingSession>> {
        debug!("Opening HTTP session for {}", target_url);
        Ok(Box::new(HttpSession::new(self.client.clone(), target_url.clone(), options.clone())))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// A session over static markup.
///
/// Consent overlays and lazy loading need a script engine, so those steps are
/// skipped. Advancing follows the `href` of the next-page control.
pub struct HttpSession {
    client: Client,
    current_url: Url,
    last_html: Option<String>,
    options: RenderOptions,
    closed: bool,
}

impl HttpSession {
    fn new(client: Client, target_url: Url, options: RenderOptions) -> Self {
        Self {
            client,
            current_url: target_url,
            last_html: None,
            options,
            closed: false,
        }
    }

    async fn fetch(&self) -> ScrapeResult<String> {
        let url = self.current_url.clone();
        let timeout = self.options.page_ready_timeout;

        let request = async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| map_request_error(&url, timeout, e))?;

            check_status(&url, response.status())?;

            response
                .text()
                .await
                .map_err(|e| map_request_error(&url, timeout, e))
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| ScrapeError::NavigationTimeout {
                url: url.to_string(),
                timeout,
            })?
    }
}

#[async_trait]
impl RenderingSession for HttpSession {
    async fn render_page(&mut self) -> ScrapeResult<MarkupSnapshot> {
        if self.closed {
            return Err(ScrapeError::crashed("HTTP session already closed"));
        }

        self.last_html = None;
        let html = self.fetch().await?;

        if let Some(ready) = self.options.ready_selector.as_deref() {
            if !contains_selector(&html, ready)? {
                return Err(ScrapeError::NavigationTimeout {
                    url: self.current_url.to_string(),
                    timeout: self.options.page_ready_timeout,
                });
            }
        }

        debug!("Fetched {} bytes from {}", html.len(), self.current_url);
        self.last_html = Some(html.clone());

        Ok(MarkupSnapshot {
            url: self.current_url.to_string(),
            html,
            rendered_at: Utc::now(),
        })
    }

    async fn advance_to_next_page(&mut self, next_page_selector: &str) -> ScrapeResult<bool> {
        if self.closed {
            return Err(ScrapeError::crashed("HTTP session already closed"));
        }

        let Some(html) = self.last_html.as_deref() else {
            return Ok(false);
        };

        match next_page_url(html, next_page_selector, &self.current_url)? {
            Some(next) => {
                debug!("Advancing to {}", next);
                self.current_url = next;
                self.last_html = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&mut self) -> ScrapeResult<()> {
        self.closed = true;
        self.last_html = None;
        Ok(())
    }
}

fn parse_selector(selector: &str, field: &str) -> ScrapeResult<Selector> {
    Selector::parse(selector).map_err(|_| ScrapeError::InvalidSelector {
        field: field.to_string(),
        selector: selector.to_string(),
    })
}

fn contains_selector(html: &str, selector: &str) -> ScrapeResult<bool> {
    let selector = parse_selector(selector, "ready_selector")?;
    Ok(Html::parse_document(html).select(&selector).next().is_some())
}

/// Resolve the first enabled next-page control to an absolute URL
pub fn next_page_url(html: &str, next_page_selector: &str, current: &Url) -> ScrapeResult<Option<Url>> {
    let selector = parse_selector(next_page_selector, "next_page")?;
    let document = Html::parse_document(html);

    let next = document
        .select(&selector)
        .filter(|control| !is_disabled(control))
        .filter_map(|control| control.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
        .find_map(|href| current.join(href).ok())
        .filter(|next| next != current);

    Ok(next)
}

/// Client errors other than 408 and 429 will not change on retry
fn check_status(url: &Url, status: StatusCode) -> ScrapeResult<()> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT && status != StatusCode::TOO_MANY_REQUESTS {
        return Err(ScrapeError::PageRefused {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Err(ScrapeError::NavigationFailed {
        url: url.to_string(),
        message: format!("HTTP {}", status),
    })
}

fn map_request_error(url: &Url, timeout: Duration, err: reqwest::Error) -> ScrapeError {
    if err.is_timeout() {
        ScrapeError::NavigationTimeout {
            url: url.to_string(),
            timeout,
        }
    } else {
        ScrapeError::NavigationFailed {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
