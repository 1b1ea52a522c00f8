//! Error handling for the research queue.
//!
//! This module provides:
//! - A single error type with machine-readable codes
//! - HTTP status mapping for the control API
//! - User-facing messages kept apart from internal detail
//! - Severity-aware logging and an error counter
//!
//! Failures of the external research call are not represented here; they are
//! [`crate::research::RequestFailure`] values that only drive job transitions.
//!
//! # Usage
//!
//! ```rust,ignore
//! use research_queue_core::error::{QueueError, Result, ErrorContext};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("jobs.json").context("Failed to read job dump")
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
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

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    InvalidStateTransition,

    // Store Errors (2000-2099)
    StoreError,
    StoreUnavailable,
    StoreTimeout,
    StoreQueryFailed,
    RecordNotFound,
    DuplicateRecord,
    AllStoresUnavailable,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,
    MissingRequiredField,
    InvalidFormat,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::InvalidStateTransition => 1001,

            Self::StoreError => 2000,
            Self::StoreUnavailable => 2001,
            Self::StoreTimeout => 2002,
            Self::StoreQueryFailed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,
            Self::AllStoresUnavailable => 2006,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,
            Self::MissingRequiredField => 4102,
            Self::InvalidFormat => 4103,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::JobNotFound | Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::DuplicateRecord | Self::InvalidStateTransition => StatusCode::CONFLICT,

            Self::ValidationError
            | Self::InvalidInput
            | Self::MissingRequiredField
            | Self::InvalidFormat => StatusCode::UNPROCESSABLE_ENTITY,

            Self::StoreUnavailable | Self::AllStoresUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            Self::StoreTimeout => StatusCode::GATEWAY_TIMEOUT,

            Self::StoreError
            | Self::StoreQueryFailed
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreError
                | Self::StoreUnavailable
                | Self::StoreTimeout
                | Self::StoreQueryFailed
                | Self::AllStoresUnavailable
        )
    }

    /// Whether a store returning this code should hand the operation to the
    /// next tier. Answers about the data itself (missing row, duplicate id,
    /// bad payload) are final and never fall through.
    pub const fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Self::StoreError
                | Self::StoreUnavailable
                | Self::StoreTimeout
                | Self::StoreQueryFailed
                | Self::AllStoresUnavailable
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
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
    /// Caller errors (bad input, unknown job)
    Low,
    /// A single store tier misbehaving
    Medium,
    /// Data or configuration problems
    High,
    /// Nothing left to fall back to
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat
            | ErrorCode::JobNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::StoreError
            | ErrorCode::StoreUnavailable
            | ErrorCode::StoreTimeout
            | ErrorCode::StoreQueryFailed => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::AllStoresUnavailable | ErrorCode::InternalError | ErrorCode::UnknownError => {
                Self::Critical
            }
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

    /// Related entity ID (job id, store name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Offending field for validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
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

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.field.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for queue, store and configuration failures.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
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

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a validation error pinned to one request field.
    pub fn invalid_field(
        code: ErrorCode,
        field: &'static str,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(code, message).with_details(ErrorDetails::new().with_field(field))
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration is invalid",
            message,
        )
    }

    /// Create a job not found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        let (from, to) = (from.to_string(), to.to_string());
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition: {} -> {}", from, to),
        )
        .with_context("from_state", from)
        .with_context("to_state", to)
    }

    /// Create an error for a store tier that could not be reached.
    pub fn store_unavailable(store: &'static str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreUnavailable,
            format!("Job store '{}' is unavailable", store),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("store", store))
    }

    /// Create an error for a store call that exceeded its deadline.
    pub fn store_timeout(store: &'static str, operation: &'static str) -> Self {
        Self::new(
            ErrorCode::StoreTimeout,
            format!("Job store '{}' timed out during {}", store, operation),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("store", store)
                .with_context("operation", operation),
        )
    }

    /// Create an error for a store that answered but rejected the operation.
    pub fn store_query_failed(store: &'static str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StoreQueryFailed,
            format!("Job store '{}' rejected the operation", store),
            reason,
        )
        .with_details(ErrorDetails::new().with_entity("store", store))
    }

    /// Create the error returned when no tier is left to serve a call.
    pub fn all_stores_unavailable(operation: &'static str) -> Self {
        Self::new(
            ErrorCode::AllStoresUnavailable,
            "No job store is currently available",
        )
        .with_context("operation", operation)
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

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// See [`ErrorCode::triggers_fallback`].
    pub fn triggers_fallback(&self) -> bool {
        self.code.triggers_fallback()
    }

    pub fn is_validation(&self) -> bool {
        self.code.category() == "validation"
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.code, ErrorCode::JobNotFound | ErrorCode::RecordNotFound)
    }

    /// Get the error severity.
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
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
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
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "rq_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,

    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&QueueError> for ErrorResponse {
    fn from(error: &QueueError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
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
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| QueueError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| QueueError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| QueueError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| QueueError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested record was not found"),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A job with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::StoreQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => (ErrorCode::StoreUnavailable, "Unable to connect to the database"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorCode::DeserializationError, "Stored job record could not be decoded")
            }
            _ => (ErrorCode::StoreError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreUnavailable, "Unable to connect to redis")
        } else if error.is_timeout() {
            (ErrorCode::StoreTimeout, "Redis operation timed out")
        } else {
            (ErrorCode::StoreError, "A redis error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for QueueError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::StoreTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::TimedOut => (ErrorCode::StoreTimeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::StoreUnavailable, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<QueueError>() {
            Ok(queue_error) => queue_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for QueueError {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_422() {
        let err = QueueError::validation("query must not be empty");
        assert_eq!(err.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.is_validation());
        assert!(!err.triggers_fallback());
    }

    #[test]
    fn test_store_failures_trigger_fallback() {
        assert!(QueueError::store_unavailable("redis", "refused").triggers_fallback());
        assert!(QueueError::store_timeout("postgres", "claim").triggers_fallback());
        assert!(!QueueError::job_not_found("abc").triggers_fallback());
        assert!(!QueueError::new(ErrorCode::DuplicateRecord, "dup").triggers_fallback());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::JobNotFound.category(), "job");
        assert_eq!(ErrorCode::StoreTimeout.category(), "store");
        assert_eq!(ErrorCode::InvalidFormat.category(), "validation");
        assert_eq!(ErrorCode::UnknownError.category(), "internal");
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let err = QueueError::new(ErrorCode::InternalError, "boom");
        let response = ErrorResponse::from(&err);
        assert!(response.error.details.is_none());

        let err = QueueError::invalid_field(ErrorCode::InvalidFormat, "output_format", "bad format");
        let response = ErrorResponse::from(&err);
        assert_eq!(
            response.error.details.and_then(|d| d.field),
            Some("output_format".to_string())
        );
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = QueueError::store_unavailable("redis", "connection refused");
        let rendered = err.to_string();
        assert!(rendered.contains("StoreUnavailable"));
        assert!(rendered.contains("connection refused"));
    }
}
