use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("preflight validation failed:\n{0}")]
    Preflight(String),

    #[error("archive error: {0}")]
    Archive(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("study '{0}' not found in archive")]
    StudyNotFound(String),

    #[error("suggestion error for {param}: {reason}")]
    Suggestion { param: String, reason: String },

    #[error("reconnaissance error: {0}")]
    Recon(String),

    #[error("effectuation error: {0}")]
    Effectuation(String),

    #[error("rollback failed for target {target_id}: {reason}")]
    Rollback { target_id: u32, reason: String },

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn suggestion(param: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Suggestion {
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}
