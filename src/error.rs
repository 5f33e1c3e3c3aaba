//! Error types for Epoxy

use std::io;

use thiserror::Error;

/// Result type alias for Epoxy
pub type Result<T> = std::result::Result<T, Error>;

/// Epoxy startup and lifecycle errors
///
/// Request-path failures never surface as this type; each identity stage
/// answers with a bare status code and logs its own error.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A route could not be turned into a proxy handler
    #[error("Invalid route '{prefix}': {reason}")]
    Route {
        /// Route prefix as configured
        prefix: String,
        /// What was wrong with it
        reason: String,
    },

    /// Signing or verification key could not be loaded
    #[error("Key error: {0}")]
    Key(#[from] jsonwebtoken::errors::Error),

    /// A listener failed to bind its address
    #[error("Failed to bind listener '{name}' on {addr}: {source}")]
    Bind {
        /// Listener name
        name: String,
        /// Address that could not be bound
        addr: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl Error {
    /// Shorthand for [`Error::Config`]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
