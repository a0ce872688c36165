use std::io;

use rusqlite::ffi::ErrorCode;
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
    #[error("geocoder: {0}")]
    Geocoder(String),
    #[error("candidate extraction: {0}")]
    Extraction(String),
}

impl AppError {
    /// Lock contention that a later attempt may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Database(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> AppError {
        AppError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn busy_and_locked_are_transient() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_transient());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_transient());
    }

    #[test]
    fn other_failures_are_not_transient() {
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).is_transient());
        assert!(!AppError::Config("bad".into()).is_transient());
    }
}
