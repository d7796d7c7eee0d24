use thiserror::Error;

/// Failures that propagate out of the tuning core.
///
/// Recoverable conditions never show up here: a weak model profile only lowers
/// its confidence, a missing GPU reading falls back to a manual or default
/// budget, and malformed history rows are skipped while reading. Launch
/// outcomes (OOM, crash, user stop) are classifications, not errors, and are
/// reported through [`crate::monitor::LaunchOutcome`].
#[derive(Debug, Error)]
pub enum TuneError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("history store: {0}")]
    History(#[from] rusqlite::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("invalid launch command: {0}")]
    InvalidCommand(String),

    #[error("no remembered configuration for model {0}")]
    NoRememberedRun(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TuneError>;
