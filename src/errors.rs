use thiserror::Error;

/// Convenience alias for fallible results across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Graph or transport configuration problem, reported at build time.
    #[error("{0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("authentication loop exceeded {0} steps")]
    LoopGuard(usize),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
