use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for a scraping run
#[derive(Error, Debug)]
pub enum ScrapeError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid selector for {field}: {selector}")]
    InvalidSelector { field: String, selector: String },

    // Transient navigation errors
    #[error("Page did not become ready within {}ms: {url}", .timeout.as_millis())]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("Navigation failed: {url} - {message}")]
    NavigationFailed { url: String, message: String },

    // Structural errors
    #[error("Rendering session crashed: {reason}")]
    SessionCrashed { reason: String },

    #[error("Malformed markup: {message}")]
    MalformedMarkup { message: String },

    #[error("Page refused: {url} - HTTP {status}")]
    PageRefused { url: String, status: u16 },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Run {run_id} was cancelled")]
    Cancelled { run_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ScrapeError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Create a session crash error
    pub fn crashed(reason: impl Into<String>) -> Self {
        Self::SessionCrashed { reason: reason.into() }
    }

    /// Create a malformed markup error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMarkup { message: message.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the failed operation may be retried on the same session
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout { .. } | Self::NavigationFailed { .. }
        )
    }

    /// Whether the rendering session is gone and must not be used again
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionCrashed { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } | Self::InvalidSelector { .. } => "configuration",
            Self::NavigationTimeout { .. } | Self::NavigationFailed { .. } => "transient",
            Self::SessionCrashed { .. } | Self::MalformedMarkup { .. } | Self::PageRefused { .. } => "structural",
            Self::Storage { .. } => "storage",
            Self::Cancelled { .. } | Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for scraping operations
pub type ScrapeResult<T> = std::result::Result<T, ScrapeError>;

impl From<rusqlite::Error> for ScrapeError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage { message: err.to_string() }
    }
}

impl From<url::ParseError> for ScrapeError {
    fn from(err: url::ParseError) -> Self {
        Self::Configuration { message: format!("invalid URL: {}", err) }
    }
}

/// Data-quality reason a candidate was not accepted. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingName,
    InvalidPrice,
    InvalidDiscount,
    MissingKey,
    DuplicateInBatch,
    DuplicateInRun,
    StorageFailure,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingName => "missing_name",
            Self::InvalidPrice => "invalid_price",
            Self::InvalidDiscount => "invalid_discount",
            Self::MissingKey => "missing_key",
            Self::DuplicateInBatch => "duplicate_in_batch",
            Self::DuplicateInRun => "duplicate_in_run",
            Self::StorageFailure => "storage_failure",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = ScrapeError::config("Invalid setting");
        assert_eq!(error.category(), "configuration");
        assert!(!error.is_transient());
    }

    #[test]
    fn test_transient_errors() {
        let timeout = ScrapeError::NavigationTimeout {
            url: "https://example.com".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_session_fatal());
        assert!(timeout.to_string().contains("30000ms"));

        let crashed = ScrapeError::crashed("browser process exited");
        assert!(!crashed.is_transient());
        assert!(crashed.is_session_fatal());
        assert_eq!(crashed.category(), "structural");

        let malformed = ScrapeError::malformed("empty document");
        assert!(!malformed.is_transient());
        assert!(!malformed.is_session_fatal());

        let refused = ScrapeError::PageRefused {
            url: "https://example.com/gone".to_string(),
            status: 404,
        };
        assert!(!refused.is_transient());
        assert!(!refused.is_session_fatal());
        assert_eq!(refused.category(), "structural");
        assert!(refused.to_string().contains("HTTP 404"));
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(RejectReason::DuplicateInBatch.to_string(), "duplicate_in_batch");
        assert_eq!(RejectReason::InvalidPrice.as_str(), "invalid_price");
    }
}
