//! Error types for Omnicast

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OmnicastError>;

#[derive(Error, Debug)]
pub enum OmnicastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl OmnicastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            OmnicastError::InvalidInput(_) => 3,
            OmnicastError::Platform(PlatformError::Authentication(_))
            | OmnicastError::Platform(PlatformError::AuthExpired { .. }) => 2,
            OmnicastError::Platform(_) => 1,
            OmnicastError::Config(_) => 1,
            OmnicastError::Database(_) => 1,
            OmnicastError::NotFound(_) => 1,
            OmnicastError::Conflict(_) => 1,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            OmnicastError::Platform(platform_error) => platform_error.is_transient(),
            OmnicastError::Database(_) => true,
            _ => false,
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

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Failures reported by a destination or by the Platform API Client
///
/// The variants follow the publish error taxonomy: `Network`, `RateLimit` and
/// `Timeout` are transient; everything else is terminal for the current
/// attempt and is surfaced to the task owner.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization expired for {destination} account {account_id}; the account must be re-authorized")]
    AuthExpired {
        destination: String,
        account_id: String,
    },

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Rejected by destination: {0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Media processing failed: {0}")]
    Processing(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::Network(_) | PlatformError::RateLimit(_) | PlatformError::Timeout(_)
        )
    }
}
