//! Error types for biocrypt

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for biocrypt
#[derive(Error, Debug)]
pub enum Error {
    // Caller errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Vault errors
    #[error("Key vault error: {0}")]
    Vault(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // Authentication outcomes
    #[error("Authentication denied")]
    AuthenticationDenied,

    #[error("Authentication cancelled")]
    AuthenticationCancelled,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    // Crypto errors
    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the outcomes a biometric prompt can end with
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationDenied
                | Error::AuthenticationCancelled
                | Error::AuthenticationFailed(_)
        )
    }

    /// True when the caller sent something unusable and no prompt was shown.
    ///
    /// This is the only class the method channel reports as a structured error;
    /// every other failure collapses to an absent result.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
