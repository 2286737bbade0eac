use thiserror::Error;

/// Errors surfaced by the durable side of the engine.
///
/// Lookup misses and moderation checks never produce one of these; they are
/// plain `Option`/`bool` outcomes.
#[derive(Debug, Error)]
pub enum RepeaterError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

pub type Result<T> = std::result::Result<T, RepeaterError>;
