//! # Animart Common
//!
//! Common utilities, error types, and logging configuration for the Animart
//! offline worker runtime.
//!
//! ## Features
//!
//! - Unified error type with log categories
//! - Logging configuration and setup
//! - Timeout helper for bounded network operations
//! - `Option` extension for not-found lookups

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::with_timeout;

/// Unified error type for Animart.
#[derive(Error, Debug)]
pub enum AnimartError {
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

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl AnimartError {
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

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            AnimartError::Config { .. } => "config",
            AnimartError::Io(_) => "io",
            AnimartError::Timeout(_) => "timeout",
            AnimartError::NotFound(_) => "not_found",
            AnimartError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for Animart operations.
pub type Result<T> = std::result::Result<T, AnimartError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| AnimartError::NotFound(resource.into()))
    }
}
