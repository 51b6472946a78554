use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::core::reconcile::{KeyConfig, ReconcileSettings};
use crate::error::{ScrapeError, ScrapeResult};
use crate::logging::LoggingConfig;
use crate::scraper::extractor::{fields, ExtractionMethod, Extractor, FieldMap, FieldRule};
use crate::scraper::rate_limiter::ThrottleConfig;
use crate::scraper::retry::RetryConfig;
use crate::scraper::session::RenderOptions;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub enable_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: get_data_directory().join("catalog.db"),
            enable_wal: true,
        }
    }
}

/// Which rendering backend opens sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// Static markup fetched over HTTP
    Http,
    /// Headless Chromium
    Browser,
}

impl fmt::Display for SessionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionBackend::Http => write!(f, "http"),
            SessionBackend::Browser => write!(f, "browser"),
        }
    }
}

impl FromStr for SessionBackend {
    type Err = ScrapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "http" => Ok(SessionBackend::Http),
            "browser" => Ok(SessionBackend::Browser),
            other => Err(ScrapeError::config(format!("unknown session backend: {}", other))),
        }
    }
}

/// Settings shared by every session a factory opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub backend: SessionBackend,
    pub headless: bool,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    pub viewport_width: i32,
    pub viewport_height: i32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backend: SessionBackend::Http,
            headless: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            request_timeout_seconds: 30,
            viewport_width: 1920,
            viewport_height: 1080,
        }
    }
}

/// Parameters of a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub target_url: String,
    /// Page bound, 0 means unlimited
    pub max_pages: u32,
    pub field_map: FieldMap,
    pub next_page_selector: String,
    #[serde(default)]
    pub consent_overlay_selector: Option<String>,
    #[serde(default)]
    pub ready_selector: Option<String>,
    pub scroll_cycles: u32,
    pub scroll_pause_ms: u64,
    pub page_ready_timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default = "default_unavailable_markers")]
    pub unavailable_markers: Vec<String>,
    /// A `running` record of this target older than this is treated as left behind by a dead process
    #[serde(default = "default_orphan_after_minutes")]
    pub orphan_after_minutes: u64,
}

/// Upper bound for `orphan_after_minutes` (one year)
const MAX_ORPHAN_AFTER_MINUTES: u64 = 525_600;

fn default_unavailable_markers() -> Vec<String> {
    ReconcileSettings::default().unavailable_markers
}

fn default_orphan_after_minutes() -> u64 {
    360
}

impl Default for RunConfig {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(fields::NAME.to_string(), FieldRule::text(".grid-box__headline"));
        rules.insert(fields::PRICE.to_string(), FieldRule::text(".m-price__price"));
        rules.insert(fields::DISCOUNT.to_string(), FieldRule::text(".m-price__label"));
        rules.insert(fields::IMAGE_URL.to_string(), FieldRule::text("img").with_extraction(ExtractionMethod::Src));
        rules.insert(fields::PRODUCT_URL.to_string(), FieldRule::text("a").with_extraction(ExtractionMethod::Href));
        rules.insert(fields::AVAILABILITY.to_string(), FieldRule::text(".product-grid-box__availabilities"));

        Self {
            target_url: "https://www.lidl.de/c/billiger-montag/a10006065".to_string(),
            max_pages: 10,
            field_map: FieldMap {
                card_selector: ".product-grid-box".to_string(),
                fields: rules,
            },
            next_page_selector: ".s-load-more__button".to_string(),
            consent_overlay_selector: Some("#onetrust-accept-btn-handler".to_string()),
            ready_selector: Some(".product-grid-box".to_string()),
            scroll_cycles: 3,
            scroll_pause_ms: 1_000,
            page_ready_timeout_seconds: 30,
            retry: RetryConfig::default(),
            throttle: ThrottleConfig::default(),
            key: KeyConfig::default(),
            unavailable_markers: default_unavailable_markers(),
            orphan_after_minutes: default_orphan_after_minutes(),
        }
    }
}

impl RunConfig {
    pub fn page_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.page_ready_timeout_seconds)
    }

    pub fn scroll_pause(&self) -> Duration {
        Duration::from_millis(self.scroll_pause_ms)
    }

    pub fn orphan_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.orphan_after_minutes.min(MAX_ORPHAN_AFTER_MINUTES) as i64)
    }

    /// Parsed target URL
    pub fn target(&self) -> ScrapeResult<Url> {
        let url = Url::parse(self.target_url.trim())?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ScrapeError::config(format!(
                "target_url must be http(s), got scheme '{}'",
                other
            ))),
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            ready_selector: non_empty(&self.ready_selector),
            page_ready_timeout: self.page_ready_timeout(),
            consent_overlay_selector: non_empty(&self.consent_overlay_selector),
            scroll_cycles: self.scroll_cycles,
            scroll_pause: self.scroll_pause(),
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            key: self.key.clone(),
            unavailable_markers: self.unavailable_markers.clone(),
        }
    }

    /// Check everything that can be checked before any navigation
    pub fn validate(&self) -> ScrapeResult<()> {
        self.target()?;

        for required in [fields::NAME, fields::PRICE] {
            if !self.field_map.fields.contains_key(required) {
                return Err(ScrapeError::config(format!(
                    "field_map is missing the required '{}' rule",
                    required
                )));
            }
        }

        if self.next_page_selector.trim().is_empty() {
            return Err(ScrapeError::config("next_page_selector must not be empty"));
        }

        // Compiling the extractor checks the card, field and next-page selectors
        Extractor::compile(&self.field_map, &self.next_page_selector)?;

        for (field, selector) in [
            ("consent_overlay_selector", &self.consent_overlay_selector),
            ("ready_selector", &self.ready_selector),
        ] {
            if let Some(selector) = non_empty(selector) {
                if ::scraper::Selector::parse(&selector).is_err() {
                    return Err(ScrapeError::InvalidSelector {
                        field: field.to_string(),
                        selector,
                    });
                }
            }
        }

        if self.page_ready_timeout_seconds == 0 {
            return Err(ScrapeError::config("page_ready_timeout_seconds must be > 0"));
        }

        if self.orphan_after_minutes == 0 || self.orphan_after_minutes > MAX_ORPHAN_AFTER_MINUTES {
            return Err(ScrapeError::config(format!(
                "orphan_after_minutes must be between 1 and {}",
                MAX_ORPHAN_AFTER_MINUTES
            )));
        }

        if self.throttle.min_delay_ms > self.throttle.max_delay_ms {
            return Err(ScrapeError::config(format!(
                "throttle window is inverted: min {}ms > max {}ms",
                self.throttle.min_delay_ms, self.throttle.max_delay_ms
            )));
        }

        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ScrapeError::config("retry multiplier must be >= 1.0"));
        }

        if self.retry.ceiling_ms < self.retry.base_delay_ms {
            return Err(ScrapeError::config("retry ceiling_ms must be >= base_delay_ms"));
        }

        // Surfaces an invalid key.url_pattern
        crate::core::reconcile::ReconciliationEngine::new(&self.reconcile_settings())?;

        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl AppConfig {
    /// Load configuration from the default location, writing defaults when none exists
    pub async fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from_file(&config_path).await
        } else {
            info!("No configuration file found, using defaults");
            let config = Self::default();
            config.save_to_file(&config_path).await?;
            Ok(config)
        }
    }

    /// Load configuration from specific file
    pub async fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> ScrapeResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ScrapeError::config("database path must not be empty"));
        }

        if self.session.request_timeout_seconds == 0 {
            return Err(ScrapeError::config("session request_timeout_seconds must be > 0"));
        }

        if self.session.user_agent.trim().is_empty() {
            return Err(ScrapeError::config("session user_agent must not be empty"));
        }

        self.run.validate()
    }

    /// Ensure the database directory exists
    pub async fn ensure_directories(&self) -> Result<()> {
        if let Some(dir) = self.database.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                tokio::fs::create_dir_all(dir).await?;
                info!("Created directory: {}", dir.display());
            }
        }
        Ok(())
    }
}

/// Get the default data directory
fn get_data_directory() -> PathBuf {
    directories::ProjectDirs::from("com", "catalog", "scraper")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("data"))
}

/// Get the configuration file path
pub fn get_config_path() -> PathBuf {
    directories::ProjectDirs::from("com", "catalog", "scraper")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("config.toml"))
}

/// Environment-based configuration overrides
pub struct ConfigOverrides;

impl ConfigOverrides {
    /// Apply environment variable overrides to configuration
    pub fn apply(config: &mut AppConfig) {
        Self::apply_from(config, |key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_from<F>(config: &mut AppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db_path) = lookup("CATALOG_DB_PATH") {
            config.database.path = PathBuf::from(db_path);
        }

        if let Some(target_url) = lookup("CATALOG_TARGET_URL") {
            config.run.target_url = target_url;
        }

        if let Some(max_pages) = lookup("CATALOG_MAX_PAGES").and_then(|v| v.parse::<u32>().ok()) {
            config.run.max_pages = max_pages;
        }

        if let Some(backend) = lookup("CATALOG_SESSION_BACKEND").and_then(|v| v.parse().ok()) {
            config.session.backend = backend;
        }

        if let Some(log_level) = lookup("CATALOG_LOG_LEVEL") {
            config.logging.level = log_level;
        }
    }
}
