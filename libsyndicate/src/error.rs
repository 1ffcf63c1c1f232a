//! Error types for Syndicate

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyndicateError>;

#[derive(Error, Debug)]
pub enum SyndicateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not eligible: {0}")]
    NotEligible(String),
}

impl SyndicateError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyndicateError::Validation(_)
            | SyndicateError::InvalidTime(_)
            | SyndicateError::InvalidState(_) => 3,
            SyndicateError::Platform(PlatformError::Authentication(_))
            | SyndicateError::Platform(PlatformError::Forbidden(_)) => 2,
            SyndicateError::Platform(_) => 1,
            SyndicateError::Config(_) => 2,
            SyndicateError::Database(_) => 1,
            SyndicateError::NotEligible(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors surfaced by platform adapters during publish attempts.
///
/// The transient variants are governed by the backoff policy; the permanent
/// variants terminate that platform's attempts and flag manual review.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    #[error("Duplicate content rejected: {0}")]
    Duplicate(String),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        /// Provider-supplied retry-after hint, in seconds
        retry_after: Option<u64>,
    },

    #[error("Upstream server error: {0}")]
    Server(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl PlatformError {
    /// Permanent failures are never retried, regardless of attempt count.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PlatformError::Authentication(_)
                | PlatformError::Forbidden(_)
                | PlatformError::Duplicate(_)
                | PlatformError::Malformed(_)
        )
    }

    /// Transient failures are eligible for backoff-governed retry.
    pub fn is_transient(&self) -> bool {
        !self.is_permanent()
    }
}
