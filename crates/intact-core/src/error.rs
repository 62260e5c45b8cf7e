use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid context construction (bad index filename, worker count, ...).
    #[error("{0}")]
    Config(String),

    /// Malformed store document or index blob.
    #[error("invalid store data: {0}")]
    Store(String),

    /// Cooperative cancellation. Pending atom-store exports are discarded
    /// when this surfaces out of a run.
    #[error("aborted")]
    Aborted,

    /// The platform or filesystem lacks extent/dedup support.
    #[error("operation not supported")]
    Unsupported,
}

impl Error {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
