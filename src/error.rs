//! Crate-wide error taxonomy.
//!
//! User-input and precondition failures are not errors at this level: handlers
//! recover those locally and answer the user. What lands here is everything
//! that cannot be turned into a specific reply in place.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A `response_to` chain could not be resolved (message missing, or the
    /// referenced message carries no command). Surfaced as an internal error,
    /// never retried.
    #[error("broken reply chain: {0}")]
    BrokenChain(String),

    /// Inbound payload of a kind the adapter does not recognize.
    #[error("unrecognized payload: {0}")]
    Classification(String),

    /// Generated or transcribed text the downstream renderer cannot take.
    /// Handlers catch this and reply to the user instead of propagating.
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payment error: {0}")]
    Payment(String),

    #[error("mail provider error: {0}")]
    Mail(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Duplicate-key violations are surfaced distinctly so callers can decide
    /// between idempotent no-op and hard failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateEntry(_))
    }
}
