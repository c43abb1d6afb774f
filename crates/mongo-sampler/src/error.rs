//! Error types for the sampler library.

use thiserror::Error;

/// Main error type for verification operations.
#[derive(Error, Debug)]
pub enum SamplerError {
    /// Configuration error (missing flag, malformed filter file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Driver-level error against the source, target, or metadata cluster
    #[error("Database error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// BSON encoding error
    #[error("BSON error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// JSON deserialization error (filter file)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A check failed for a single namespace; other namespaces continue
    #[error("Namespace {ns} failed: {message}")]
    Namespace { ns: String, message: String },

    /// A `db.coll` token that does not split into exactly two parts
    #[error("Malformed namespace {0:?}, expected db.coll")]
    MalformedNamespace(String),

    /// The run was cancelled (SIGINT, etc.)
    #[error("Run cancelled")]
    Cancelled,
}

impl SamplerError {
    /// Create a per-namespace error.
    pub fn namespace(ns: impl Into<String>, message: impl Into<String>) -> Self {
        SamplerError::Namespace {
            ns: ns.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, SamplerError>;
