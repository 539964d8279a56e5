use thiserror::Error;

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential unavailable: {0}")]
    Credential(String),

    #[error("External API error: {0}")]
    ExternalApi(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Indicator error for {instrument}: {reason}")]
    Indicator { instrument: String, reason: String },

    #[error("Job {job} failed: {reason}")]
    Job { job: String, reason: String },

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

impl AppError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ExternalApi(_)
                | AppError::Reqwest(_)
                | AppError::Tungstenite(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
