//! Error types for trace delivery operations.
//!
//! Covers adapter transport failures, configuration problems, transform
//! failures, storage failures and engine lifecycle errors. Each error knows
//! whether it is worth retrying and which category it belongs to.

use std::fmt;

use thiserror::Error;
use tracerelay_core::CoreError;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for trace delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Operation exceeded its time budget.
    #[error("timeout after {timeout_ms}ms")]
    Timeout {
        /// Budget that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// Destination responded with a client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination responded with a server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination asked us to slow down.
    #[error("rate limited by destination: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Destination configuration is missing, malformed or undecryptable.
    #[error("invalid destination configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// No adapter is registered for the destination's provider type.
    #[error("unsupported provider")]
    UnsupportedProvider {
        /// Provider type that failed to resolve
        provider_type: String,
    },

    /// A transform failed to produce a payload.
    #[error("transform failed: {message}")]
    Transform {
        /// Transform error message
        message: String,
    },

    /// Storage operation failed.
    #[error("database error: {message}")]
    Database {
        /// Database error message
        message: String,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The ingest queue is at capacity.
    #[error("ingest queue is full")]
    QueueFull,

    /// The engine is not accepting work.
    #[error("delivery engine is shut down")]
    ShutdownRequested,

    /// Workers did not stop within the shutdown budget.
    #[error("workers did not stop within {timeout_seconds}s")]
    ShutdownTimeout {
        /// Budget that was exceeded, in seconds
        timeout_seconds: u64,
    },

    /// A worker task panicked.
    #[error("worker panicked: {message}")]
    WorkerPanic {
        /// Panic description
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an unsupported provider error.
    pub fn unsupported_provider(provider_type: impl Into<String>) -> Self {
        Self::UnsupportedProvider { provider_type: provider_type.into() }
    }

    /// Creates a transform error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Determines if this error represents a temporary failure.
    ///
    /// Transport failures, timeouts, HTTP responses and storage hiccups are
    /// retryable. Configuration, unsupported providers and lifecycle errors
    /// are not. Client errors are retried too, bounded by the attempt cap.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ClientError { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Database { .. } => true,

            Self::Configuration { .. }
            | Self::UnsupportedProvider { .. }
            | Self::Transform { .. }
            | Self::NotFound { .. }
            | Self::QueueFull
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Returns true for errors that must end a delivery immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::UnsupportedProvider { .. })
    }

    /// Returns the destination's retry guidance, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(id) => Self::NotFound { entity: "entity", id },
            CoreError::InvalidInput(message) => Self::Internal { message },
            CoreError::Database(message) | CoreError::ConstraintViolation(message) => {
                Self::Database { message }
            },
        }
    }
}

/// Category of delivery error for logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Destination-side rate limiting.
    RateLimit,
    /// Configuration problems.
    Configuration,
    /// Transform failures.
    Transform,
    /// Storage operations.
    Database,
    /// Engine lifecycle and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::Configuration { .. } | DeliveryError::UnsupportedProvider { .. } => {
                Self::Configuration
            },
            DeliveryError::Transform { .. } => Self::Transform,
            DeliveryError::Database { .. } | DeliveryError::NotFound { .. } => Self::Database,
            DeliveryError::QueueFull
            | DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Configuration => write!(f, "configuration"),
            Self::Transform => write!(f, "transform"),
            Self::Database => write!(f, "database"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
