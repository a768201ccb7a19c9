//! # PwaKit Common
//!
//! Shared error type, logging configuration and retry helpers used by the
//! PwaKit offline worker crates.

use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, RetryConfig};

/// Unified error type for PwaKit infrastructure (configuration, I/O, setup).
#[derive(Error, Debug)]
pub enum PwaKitError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Logging could not be installed.
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl PwaKitError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
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

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PwaKitError::Config { .. } => "config",
            PwaKitError::Logging(_) => "logging",
            PwaKitError::Io(_) => "io",
            PwaKitError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for PwaKit infrastructure operations.
pub type Result<T> = std::result::Result<T, PwaKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap an unexpected error as an internal error with context.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PwaKitError::Internal {
            message: format!("{}: {}", message.into(), e),
            backtrace: Some(backtrace::Backtrace::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(PwaKitError::config("bad scope").category(), "config");
        assert_eq!(PwaKitError::internal("boom").category(), "internal");
        assert_eq!(
            PwaKitError::Logging("already set".into()).category(),
            "logging"
        );
    }

    #[test]
    fn test_config_with_source_keeps_source() {
        let parse = "x".parse::<u32>().unwrap_err();
        let err = PwaKitError::config_with_source("cache_name", parse);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Config error: cache_name");
    }

    #[test]
    fn test_result_context() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let err = res.context("writing cache").unwrap_err();
        assert!(matches!(err, PwaKitError::Internal { .. }));
        assert!(err.to_string().contains("writing cache: disk gone"));
    }
}
