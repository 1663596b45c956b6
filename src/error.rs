use thiserror::Error;

use crate::crypto::CryptoError;
use crate::frame::FrameError;

/// Errors raised by the local SQLite cache and evidence store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store busy after {0} attempts")]
    Busy(u32),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Errors raised by a `CentralDatabase` implementation.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("central database unreachable: {0}")]
    Unreachable(String),

    #[error("central database call timed out")]
    Timeout,

    #[error("central database rejected call: {0}")]
    Rejected(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for DatabaseError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DatabaseError::Timeout
        } else {
            DatabaseError::Unreachable(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("no key material available for {0}")]
    MissingKeyMaterial(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
