//! Error types for the credential subsystem.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no grant stored for broadcaster {0}")]
    GrantNotFound(String),

    /// The stored ciphertext could not be decrypted (bad key, corrupted blob,
    /// AAD mismatch). The grant is unusable but is not deleted; operator
    /// intervention is required. Callers must not retry.
    #[error("encrypted token unreadable for broadcaster {0}")]
    DecryptFailed(String),

    /// Encrypting a new token failed; the grant row was left untouched so the
    /// previous (still valid) ciphertext is not lost.
    #[error("token encryption failed for broadcaster {0}; grant not modified")]
    EncryptFailed(String),

    #[error("invalid timestamp in column {0}")]
    InvalidTimestamp(String),

    #[error("identity service error: {0}")]
    Identity(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for CredentialError {
    fn from(err: sqlx::Error) -> Self {
        CredentialError::Database(err.to_string())
    }
}
