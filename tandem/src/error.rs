//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid payload for {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Handler already registered for {0}")]
    DuplicateHandler(String),

    #[error("Download {0} is still active")]
    StillActive(String),

    #[error("Download {0} is already active")]
    AlreadyActive(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Compile failed: {0}")]
    Compile(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseSqlx(_) | Self::Migration(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::DuplicateHandler(_) => "DUPLICATE_HANDLER",
            Self::StillActive(_) => "STILL_ACTIVE",
            Self::AlreadyActive(_) => "ALREADY_ACTIVE",
            Self::Transfer(_) => "TRANSFER_ERROR",
            Self::Compile(_) => "COMPILE_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}
