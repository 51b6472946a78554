use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::ScrapeError;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub max_files: usize,
    pub log_directory: PathBuf,
    pub include_spans: bool,
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            console_enabled: true,
            max_files: 7,
            log_directory: PathBuf::from("logs"),
            include_spans: false,
            include_targets: true,
        }
    }
}

/// Initialize logging system
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = || {
        if config.include_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    };

    let mut layers = Vec::new();

    if config.console_enabled {
        let console_layer = fmt::layer()
            .with_target(config.include_targets)
            .with_span_events(span_events())
            .with_writer(std::io::stderr)
            .boxed();

        layers.push(console_layer);
    }

    if config.file_enabled {
        std::fs::create_dir_all(&config.log_directory)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("catalog-scraper")
            .filename_suffix("log")
            .max_log_files(config.max_files)
            .build(&config.log_directory)?;

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(config.include_targets)
            .with_span_events(span_events())
            .with_writer(file_appender)
            .boxed();

        layers.push(file_layer);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_enabled {
        info!("Log directory: {}", config.log_directory.display());
    }

    Ok(())
}

/// Structured logging context
#[derive(Debug, Clone, Serialize)]
pub struct LogContext {
    pub component: String,
    pub operation: String,
    pub run_id: Option<String>,
    pub url: Option<String>,
    pub page_index: Option<u32>,
    pub duration_ms: Option<u64>,
    pub status: Option<String>,
    pub error_category: Option<String>,
    pub additional_fields: HashMap<String, serde_json::Value>,
}

impl LogContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            run_id: None,
            url: None,
            page_index: None,
            duration_ms: None,
            status: None,
            error_category: None,
            additional_fields: HashMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_page(mut self, page_index: u32) -> Self {
        self.page_index = Some(page_index);
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error_category(mut self, category: impl Into<String>) -> Self {
        self.error_category = Some(category.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.additional_fields.insert(key.into(), value);
        self
    }

    pub fn with_number_field(mut self, key: impl Into<String>, value: impl Into<i64>) -> Self {
        self.additional_fields
            .insert(key.into(), serde_json::Value::Number(serde_json::Number::from(value.into())));
        self
    }
}

/// Structured logging macros
#[macro_export]
macro_rules! log_info {
    ($context:expr, $message:expr) => {{
        let context = &$context;
        tracing::info!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            additional_fields = ?context.additional_fields,
            $message
        );
    }};

    ($context:expr, $message:expr, $($key:ident = $value:expr),*) => {{
        let context = &$context;
        tracing::info!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            additional_fields = ?context.additional_fields,
            $($key = $value,)*
            $message
        );
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($context:expr, $message:expr) => {{
        let context = &$context;
        tracing::warn!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            error_category = context.error_category,
            additional_fields = ?context.additional_fields,
            $message
        );
    }};

    ($context:expr, $error:expr, $message:expr) => {{
        let context = &$context;
        tracing::warn!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            error_category = context.error_category,
            additional_fields = ?context.additional_fields,
            error = %$error,
            $message
        );
    }};
}

#[macro_export]
macro_rules! log_error {
    ($context:expr, $message:expr) => {{
        let context = &$context;
        tracing::error!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            error_category = context.error_category,
            additional_fields = ?context.additional_fields,
            $message
        );
    }};

    ($context:expr, $error:expr, $message:expr) => {{
        let context = &$context;
        tracing::error!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            error_category = context.error_category,
            additional_fields = ?context.additional_fields,
            error = %$error,
            $message
        );
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($context:expr, $message:expr) => {{
        let context = &$context;
        tracing::debug!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            page_index = context.page_index,
            additional_fields = ?context.additional_fields,
            $message
        );
    }};
}

/// Times an operation and logs its outcome with the elapsed duration
pub struct PerformanceLogger {
    context: LogContext,
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    pub fn new(context: LogContext) -> Self {
        Self {
            context,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn finish_with_status(self, message: &str, status: impl Into<String>) {
        let context = self
            .context
            .with_duration(self.start_time.elapsed())
            .with_status(status);
        tracing::info!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            additional_fields = ?context.additional_fields,
            "{}", message
        );
    }

    pub fn finish_with_error(self, message: &str, error: &ScrapeError) {
        let context = self
            .context
            .with_duration(self.start_time.elapsed())
            .with_status("error")
            .with_error_category(error.category());
        tracing::error!(
            component = context.component,
            operation = context.operation,
            run_id = context.run_id,
            url = context.url,
            page_index = context.page_index,
            duration_ms = context.duration_ms,
            status = context.status,
            error_category = context.error_category,
            additional_fields = ?context.additional_fields,
            error = %error,
            "{}", message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_log_context_creation() {
        let context = LogContext::new("orchestrator", "render_page")
            .with_run_id("run-123")
            .with_url("https://shop.example/catalog")
            .with_page(2)
            .with_number_field("candidates", 12);

        assert_eq!(context.component, "orchestrator");
        assert_eq!(context.operation, "render_page");
        assert_eq!(context.run_id, Some("run-123".to_string()));
        assert_eq!(context.page_index, Some(2));
        assert_eq!(context.additional_fields["candidates"], serde_json::json!(12));
    }

    #[test]
    fn test_error_context() {
        let err = ScrapeError::crashed("target closed");
        let context = LogContext::new("session", "render_page")
            .with_duration(Duration::from_millis(1500))
            .with_error_category(err.category());

        assert_eq!(context.duration_ms, Some(1500));
        assert_eq!(context.error_category.as_deref(), Some("structural"));
    }

    #[test]
    fn test_macros_accept_context() {
        let context = LogContext::new("test", "macros").with_status("ok");
        let err = ScrapeError::internal("boom");
        log_info!(context, "plain message");
        log_info!(context, "with fields", pages = 3);
        log_warn!(context, err, "warning with error");
        log_error!(context, "error message");
        log_debug!(context, "debug message");
        PerformanceLogger::new(context).finish_with_status("done", "ok");
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
    }
}
