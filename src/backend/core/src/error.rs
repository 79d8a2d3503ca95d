//! Error handling for Hive Core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and chained sources
//! - User-facing messages kept apart from internal detail
//! - Severity-aware logging through `tracing`
//! - An error counter exported through the `metrics` facade
//!
//! # Usage
//!
//! ```rust,ignore
//! use hive_core::error::{HiveError, Result, ErrorContext};
//!
//! fn read_pid(path: &Path) -> Result<u32> {
//!     let raw = std::fs::read_to_string(path).context("Failed to read PID file")?;
//!     raw.trim().parse().with_error_code(ErrorCode::ValidationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Hive operations.
pub type Result<T> = std::result::Result<T, HiveError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and appear in operator-facing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Store Errors (1000-1099)
    StoreConnectionFailed,
    StoreError,

    // Validation Errors (1100-1199)
    ValidationError,
    InvalidDelay,
    WorkerNotFound,
    JobNotFound,

    // Job Execution Errors (1200-1299)
    JobExecutionFailed,
    JobTimeout,
    HandlerNotFound,

    // Process Control Errors (1300-1399)
    SignalDeliveryFailed,
    ProcessSpawnFailed,
    StaleRegistration,

    // Serialization Errors (2000-2099)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    IoError,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::StoreConnectionFailed => 1000,
            Self::StoreError => 1001,

            Self::ValidationError => 1100,
            Self::InvalidDelay => 1101,
            Self::WorkerNotFound => 1102,
            Self::JobNotFound => 1103,

            Self::JobExecutionFailed => 1200,
            Self::JobTimeout => 1201,
            Self::HandlerNotFound => 1202,

            Self::SignalDeliveryFailed => 1300,
            Self::ProcessSpawnFailed => 1301,
            Self::StaleRegistration => 1302,

            Self::SerializationError => 2000,
            Self::DeserializationError => 2001,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::IoError => 9000,
            Self::InternalError => 9001,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Nothing in the core retries automatically; this only informs operators.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreConnectionFailed | Self::StoreError | Self::JobTimeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "store",
            1100..=1199 => "validation",
            1200..=1299 => "job",
            1300..=1399 => "process",
            2000..=2099 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Operator errors (bad input, unknown worker)
    Low,
    /// Operational issues (job failures, undeliverable signals)
    Medium,
    /// System errors (store failures, broken config)
    High,
    /// The process cannot continue
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidDelay
            | ErrorCode::WorkerNotFound
            | ErrorCode::JobNotFound
            | ErrorCode::StaleRegistration => Self::Low,

            ErrorCode::JobExecutionFailed
            | ErrorCode::JobTimeout
            | ErrorCode::HandlerNotFound
            | ErrorCode::SignalDeliveryFailed => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::ProcessSpawnFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::IoError => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (worker, job, queue)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Hive Core.
#[derive(Error, Debug)]
pub struct HiveError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Operator-facing error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for HiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl HiveError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "hive_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;

    /// Report under `code` with `message`, keeping the cause as internal detail.
    fn context_code(self, code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| HiveError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| HiveError::new(code, e.to_string()).with_source(e))
    }

    fn context_code(self, code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Result<T> {
        self.map_err(|e| HiveError::with_internal(code, message, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| HiveError::new(ErrorCode::InternalError, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| HiveError::new(code, "Value not present"))
    }

    fn context_code(self, code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Result<T> {
        self.ok_or_else(|| HiveError::new(code, message))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for HiveError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Unable to connect to the store")
        } else if error.is_timeout() {
            (ErrorCode::StoreError, "Store operation timed out")
        } else {
            (ErrorCode::StoreError, "A store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for HiveError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::JobTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for HiveError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::IoError, "File or resource not found"),
            ErrorKind::PermissionDenied => (ErrorCode::IoError, "Permission denied"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::StoreConnectionFailed, "Connection failed")
            }
            _ => (ErrorCode::IoError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for HiveError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<HiveError>() {
            Ok(hive_error) => hive_error,
            Err(error) => Self::internal(error.to_string()),
        }
    }
}

impl From<config::ConfigError> for HiveError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl HiveError {
    /// The store could not be reached at startup.
    pub fn store_unreachable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreConnectionFailed,
            format!("Unable to connect to the store at {}", url.into()),
            reason,
        )
        .with_details(
            ErrorDetails::new().with_suggestion("Check the redis settings or HIVE__REDIS__URL"),
        )
    }

    /// A delay value could not be interpreted.
    pub fn invalid_delay(value: impl Into<String>) -> Self {
        let value = value.into();
        Self::new(
            ErrorCode::InvalidDelay,
            format!("Delay option \"{}\" is invalid, value must be a non-negative integer", value),
        )
        .with_context("value", &value)
    }

    /// No worker with this ID is registered on the host.
    pub fn worker_not_found(worker_id: impl Into<String>) -> Self {
        let id = worker_id.into();
        Self::new(ErrorCode::WorkerNotFound, format!("There is no worker with id \"{}\"", id))
            .with_details(
                ErrorDetails::new()
                    .with_entity("worker", &id)
                    .with_suggestion("Run `hive worker list` to see live workers on this host"),
            )
    }

    /// No job record with this ID exists.
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        let id = job_id.into();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", &id))
    }

    /// No handler is registered for a job class.
    pub fn handler_not_found(class: impl Into<String>) -> Self {
        let class = class.into();
        Self::new(
            ErrorCode::HandlerNotFound,
            format!("No handler registered for job class \"{}\"", class),
        )
        .with_details(ErrorDetails::new().with_entity("job_class", &class))
    }

    /// A signal could not be delivered to a process.
    pub fn signal_delivery(pid: u32, signal: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::SignalDeliveryFailed,
            format!("Could not send {} to process {}", signal, pid),
            reason,
        )
        .with_context("pid", pid)
        .with_context("signal", signal)
    }

    /// A configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_categories() {
        assert_eq!(ErrorCode::StoreConnectionFailed.category(), "store");
        assert_eq!(ErrorCode::WorkerNotFound.category(), "validation");
        assert_eq!(ErrorCode::JobTimeout.category(), "job");
        assert_eq!(ErrorCode::SignalDeliveryFailed.category(), "process");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::StoreConnectionFailed.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::SignalDeliveryFailed.is_retryable());
    }

    #[test]
    fn test_worker_not_found() {
        let error = HiveError::worker_not_found("h1:42:mail");
        assert_eq!(error.code(), ErrorCode::WorkerNotFound);
        assert_eq!(error.details().entity_id.as_deref(), Some("h1:42:mail"));
        assert_eq!(error.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_error_context() {
        let error = HiveError::new(ErrorCode::ValidationError, "Invalid input")
            .with_context("field", "delay")
            .with_context("reason", "not an integer");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("reason"));
    }

    #[test]
    fn test_context_extension() {
        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let error = parsed.context_code(ErrorCode::StoreError, "Bad counter").unwrap_err();
        assert_eq!(error.code(), ErrorCode::StoreError);
        assert_eq!(error.user_message(), "Bad counter");
        assert!(error.internal_message().is_some());
        assert!(std::error::Error::source(&error).is_some());

        let missing: Option<u32> = None;
        let error = missing.context("No pid").unwrap_err();
        assert_eq!(error.code(), ErrorCode::InternalError);

        let error = "x".parse::<u32>().with_error_code(ErrorCode::ValidationError).unwrap_err();
        assert_eq!(error.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::InvalidDelay), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::JobTimeout), ErrorSeverity::Medium);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::StoreError), ErrorSeverity::High);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::StoreConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = HiveError::store_unreachable("redis://127.0.0.1:6379", "Connection refused");

        let display = format!("{}", error);
        assert!(display.contains("StoreConnectionFailed"));
        assert!(display.contains("127.0.0.1:6379"));
        assert!(display.contains("Connection refused"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobNotFound);
    }
}
