use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("job queue error: {0}")]
    Queue(String),
    #[error("geocoder error: {0}")]
    Geocoder(String),
    #[error("geocoder unavailable after {attempts} attempts: {message}")]
    GeocoderUnavailable { attempts: u32, message: String },
}

impl AppError {
    /// Constraint failures raised by SQLite itself (foreign keys, NOT NULL,
    /// CHECK, UNIQUE not covered by an upsert clause).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            AppError::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
