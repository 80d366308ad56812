//! Error types for caseflow.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("case not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency failure: the case was held, or changed under
    /// the caller between read and write. Reported, never retried.
    #[error("conflict on case {case}: {detail}")]
    Conflict { case: String, detail: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("no transition from {stage} matches {input}")]
    InvalidTransition { stage: String, input: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
