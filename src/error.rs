use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Rate limit exceeded, retry after {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("Command contains forbidden characters")]
    ForbiddenCharacters,

    #[error("URL not allowed: {0}")]
    UrlNotAllowed(String),

    #[error("Circuit breaker '{breaker}' is open")]
    CircuitOpen {
        breaker: String,
        retry_after: Duration,
    },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Command exited with status {code:?}")]
    CommandFailed { code: Option<i32> },

    #[error("Command timed out after {0:?}")]
    CommandTimedOut(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Image encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

/// Coarse classification used for logging and response translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limit exceeded; the caller may retry later.
    Admission,
    /// Missing or malformed input; never retried.
    Validation,
    /// Disallowed command or URL, rejected before any external action.
    TrustBoundary,
    /// Failures of the external action itself, counted by the breakers.
    Transient,
    /// A breaker is refusing calls; the caller should back off.
    BreakerOpen,
    Internal,
}

impl CaptureError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::RateLimited { .. } => ErrorCategory::Admission,
            CaptureError::InvalidRequest(_) => ErrorCategory::Validation,
            CaptureError::CommandNotAllowed(_)
            | CaptureError::ForbiddenCharacters
            | CaptureError::UrlNotAllowed(_) => ErrorCategory::TrustBoundary,
            CaptureError::CircuitOpen { .. } => ErrorCategory::BreakerOpen,
            CaptureError::Timeout(_)
            | CaptureError::CommandFailed { .. }
            | CaptureError::CommandTimedOut(_)
            | CaptureError::NavigationFailed(_)
            | CaptureError::BrowserLaunchFailed(_)
            | CaptureError::PageError(_)
            | CaptureError::ElementNotFound(_)
            | CaptureError::CaptureFailed(_) => ErrorCategory::Transient,
            CaptureError::EncodingFailed(_)
            | CaptureError::ConfigurationError(_)
            | CaptureError::IoError(_) => ErrorCategory::Internal,
        }
    }

    /// HTTP status the request handler should answer with.
    pub fn status_hint(&self) -> u16 {
        match self.category() {
            ErrorCategory::Admission => 429,
            ErrorCategory::Validation => 400,
            ErrorCategory::TrustBoundary => 403,
            ErrorCategory::BreakerOpen => 503,
            ErrorCategory::Transient | ErrorCategory::Internal => 500,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CaptureError::RateLimited { retry_after }
            | CaptureError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether a circuit breaker records this error as a failure.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient | ErrorCategory::Internal)
    }

    pub fn is_security_event(&self) -> bool {
        self.category() == ErrorCategory::TrustBoundary
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Admission | ErrorCategory::Validation => ErrorSeverity::Low,
            ErrorCategory::Transient | ErrorCategory::BreakerOpen => ErrorSeverity::Medium,
            ErrorCategory::TrustBoundary => ErrorSeverity::High,
            ErrorCategory::Internal => ErrorSeverity::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::ConfigurationError(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::EncodingFailed(err.to_string())
    }
}
