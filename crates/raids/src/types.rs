use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaidsError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RaidsError {
    fn from(err: sqlx::Error) -> Self {
        RaidsError::Database(err.to_string())
    }
}

pub type RaidsResult<T> = Result<T, RaidsError>;
