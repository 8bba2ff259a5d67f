//! Error types for the persistence layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Lifecycle failures (open/close) are wrapped into domain kinds that carry the
//! correlation id of the call; statement failures are surfaced as the raw driver error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed [{code}]: {message} (correlation: {correlation_id})")]
    Connection {
        correlation_id: String,
        /// e.g., "CONNECT_FAILED"
        code: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("Invalid state [{code}]: {message} (correlation: {correlation_id})")]
    InvalidState {
        correlation_id: String,
        code: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Conversion failed: {message}")]
    Conversion { message: String },

    #[error(transparent)]
    Query(#[from] sqlx::Error),
}

impl DbError {
    /// Create a connection error without an underlying driver error.
    pub fn connection(
        correlation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Connection {
            correlation_id: correlation_id.into(),
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error caused by a driver error.
    pub fn connection_caused_by(
        correlation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        source: sqlx::Error,
    ) -> Self {
        Self::Connection {
            correlation_id: correlation_id.into(),
            code: code.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(
        correlation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            correlation_id: correlation_id.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a conversion error.
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    /// Get the error code for lifecycle errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connection { code, .. } => Some(code),
            Self::InvalidState { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Get the SQLSTATE of the underlying database error, if any.
    pub fn sql_state(&self) -> Option<String> {
        let err = match self {
            Self::Query(err) => err,
            Self::Connection {
                source: Some(err), ..
            } => err,
            _ => return None,
        };
        match err {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::conversion(err.to_string())
    }
}

/// Result type alias for persistence operations.
pub type DbResult<T> = Result<T, DbError>;
