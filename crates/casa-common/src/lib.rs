//! # Casa Common
//!
//! Common error types and logging configuration shared by the Casa offline shell crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support
//! - Logging configuration and setup
//! - `Option` extension trait

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for Casa.
#[derive(Error, Debug)]
pub enum CasaError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker registration and lifecycle errors.
    #[error("Registration error: {message}")]
    Registration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Platform feature unavailable.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl CasaError {
    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a registration error with source.
    pub fn registration_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Registration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transport-level failures qualify; the next update poll is the retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CasaError::Network { .. } | CasaError::Io(_))
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CasaError::Network { .. } => "network",
            CasaError::Cache { .. } => "cache",
            CasaError::Registration { .. } => "registration",
            CasaError::Config { .. } => "config",
            CasaError::Io(_) => "io",
            CasaError::NotFound(_) => "not_found",
            CasaError::Unsupported(_) => "unsupported",
            CasaError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for Casa operations.
pub type Result<T> = std::result::Result<T, CasaError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CasaError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            CasaError::network_with_source("fetching /", io_error()).category(),
            "network"
        );
        assert_eq!(CasaError::cache("test").category(), "cache");
        assert_eq!(
            CasaError::registration_with_source("register", io_error()).category(),
            "registration"
        );
        assert_eq!(
            CasaError::NotFound("waiting worker".into()).category(),
            "not_found"
        );
        assert_eq!(CasaError::internal("bug").category(), "internal");
    }

    #[test]
    fn test_retryable() {
        assert!(CasaError::network_with_source("fetching /", io_error()).is_retryable());
        assert!(CasaError::from(io_error()).is_retryable());
        assert!(!CasaError::cache("test").is_retryable());
        assert!(!CasaError::Unsupported("service workers".into()).is_retryable());
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("test"),
            Err(CasaError::NotFound(_))
        ));
    }

    #[test]
    fn test_with_source_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err = CasaError::config_with_source("reading config", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
