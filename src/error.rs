use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the skema application
#[derive(Error, Debug)]
pub enum SkemaError {
    /// Work was stopped by an explicit cancellation request, not a failure
    #[error("Operation cancelled")]
    Cancelled,

    /// A model service could not be reached at all (connection refused etc.)
    #[error("{service} is unreachable at {detail}. Is the local model service running?")]
    Unreachable { service: String, detail: String },

    /// A model service answered, but with an error status
    #[error("{service} returned an error: {detail}")]
    Upstream { service: String, detail: String },

    /// A model service response was missing expected fields
    #[error("Malformed response from {service}: {detail}")]
    MalformedResponse { service: String, detail: String },

    /// The conversation cannot fit the model's token budget even after summarization
    #[error("Conversation too long: estimated {estimated} tokens against a budget of {budget}")]
    BudgetExceeded { estimated: usize, budget: usize },

    /// No indexed collection exists for the source
    #[error("No index found for source: {source_id}")]
    NotFound { source_id: String },

    /// A crawl is already running for the source
    #[error("A crawl is already in progress for source: {source_id}")]
    CrawlInProgress { source_id: String },

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Search index errors (keyword or vector index)
    #[error("Index error: {0}")]
    Index(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SkemaError {
    /// True when the error represents "stopped by request" rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SkemaError::Cancelled)
    }

    /// True when the caller should suggest starting the local model service.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SkemaError::Unreachable { .. })
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for skema operations
pub type Result<T> = std::result::Result<T, SkemaError>;
