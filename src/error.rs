//! Error types for the tree search decoder.
//!
//! Invariant violations inside the per-frame loop are assertions. Everything
//! that can go wrong while assembling a decoder (network validation, model
//! capability checks, configuration) is reported through [`DecoderError`].

use std::io;
use thiserror::Error;

use crate::types::StateId;

/// Primary error type for the crate.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Errors from invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Structured configuration validation failures.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The search network is malformed.
    #[error("Invalid search network: {0}")]
    InvalidNetwork(String),

    /// State depths contradict the successor structure.
    #[error("Inconsistent depth at state {state}: {detail}")]
    InconsistentDepths {
        /// Offending state.
        state: StateId,
        /// Human readable reason.
        detail: String,
    },

    /// The language model does not provide a required capability.
    #[error("Language model error: {0}")]
    LanguageModel(String),

    /// Neither a sentence end nor a live state hypothesis exists.
    #[error("Search space is empty, no hypothesis survived")]
    EmptySearchSpace,

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal errors carrying context.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric parameter is out of its accepted range.
    #[error("Parameter {name} out of range: {value} ({expected})")]
    OutOfRange {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
        /// Accepted range.
        expected: &'static str,
    },

    /// Two parameters contradict each other.
    #[error("Conflicting parameters: {0}")]
    Conflict(String),

    /// Loading or merging configuration sources failed.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// Serializing configuration failed.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),
}

/// Convenience type alias for Results with DecoderError.
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to the error.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to the error.
    fn with_static_context(self, context: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DecoderError::Internal(format!("{}: {}", f(), e)))
    }

    fn with_static_context(self, context: &'static str) -> Result<T> {
        self.map_err(|e| DecoderError::Internal(format!("{}: {}", context, e)))
    }
}
