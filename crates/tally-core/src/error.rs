//! Error types for Tally

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    /// LLM call refused by the in-process throttle
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Embedding or chat capability failure (timeouts, bad responses)
    #[error("AI backend error: {0}")]
    Ai(String),
}

impl Error {
    /// Storage failures abort a categorization attempt; everything else
    /// is absorbed by the stage that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Pool(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Database(rusqlite::Error::InvalidQuery).is_fatal());
        assert!(!Error::Ai("timeout".into()).is_fatal());
        assert!(!Error::InvalidData("bad json".into()).is_fatal());
        assert!(!Error::Validation("confidence".into()).is_fatal());
    }
}
