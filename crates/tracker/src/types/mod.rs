use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid timestamp in column {0}")]
    InvalidTimestamp(String),

    #[error("no open session for broadcaster {0}")]
    NoOpenSession(String),
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        TrackerError::Database(err.to_string())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
