//! Sync error handling
//!
//! Provides typed errors for sync operations with descriptive messages
//! and status text the host can show to the user.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while syncing
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or remote backend failure (transient, retried on the next tick)
    #[error("Remote backend error: {message}")]
    NetworkOrBackend { message: String },

    /// No remote backend configured; sync is disabled
    #[error("Cloud sync is not configured. Set remote_url and remote_api_key, or remote_db.")]
    NotConfigured,

    /// Session-scoped storage cannot be used
    #[error("Session storage unavailable: {details}")]
    StorageUnavailable { details: String },

    /// The identity provider refused another login link for now
    #[error("Too many login requests. Try again in {} seconds.", retry_after.as_secs())]
    LoginRateLimited { retry_after: Duration },

    /// An operation needs an identity but nobody is logged in
    #[error("Not logged in")]
    NotLoggedIn,

    /// Email address failed validation
    #[error("Invalid email address: '{email}'")]
    InvalidEmail { email: String },

    /// Local store could not be read or written
    #[error("Local store error at '{path}': {details}")]
    LocalStore { path: PathBuf, details: String },

    /// Payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a backend error from any displayable message
    pub fn backend(message: impl Into<String>) -> Self {
        SyncError::NetworkOrBackend {
            message: message.into(),
        }
    }

    /// Create a local store error from an I/O error with path context
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        SyncError::LocalStore {
            path,
            details: error.to_string(),
        }
    }

    /// Check if this error is retried automatically on the next tick
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::NetworkOrBackend { .. })
    }

    /// Passive status text for the host
    pub fn user_message(&self) -> String {
        match self {
            SyncError::NetworkOrBackend { .. } => {
                "Sync temporarily unavailable, will retry automatically.".to_string()
            }
            SyncError::NotConfigured => "Cloud sync is disabled (not configured).".to_string(),
            SyncError::NotLoggedIn => "Not logged in. Sign in again to resume sync.".to_string(),
            SyncError::StorageUnavailable { .. } => {
                "Session storage unavailable; automatic reload is disabled.".to_string()
            }
            SyncError::LoginRateLimited { retry_after } => format!(
                "Login link already sent. Please wait {} seconds before requesting another.",
                retry_after.as_secs()
            ),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        SyncError::backend(error.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(error: rusqlite::Error) -> Self {
        SyncError::backend(format!("database: {}", error))
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
