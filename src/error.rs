use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing secret: environment variable {0} is not set")]
    MissingSecret(String),

    #[error("Environment preparation failed: {0}")]
    Prepare(String),

    #[error("Task exited unsuccessfully ({status})")]
    TaskFailed { status: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cannot rebase {branch} onto remote: {detail}")]
    SyncConflict { branch: String, detail: String },

    #[error("Push rejected: {0}")]
    PushRejected(String),

    #[error("Run lock {path} still held after {waited:?}")]
    LockTimeout { path: String, waited: Duration },

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Run failed during {stage}: {message}")]
    RunFailed { stage: Stage, message: String },

    #[error("Interrupted")]
    Interrupted,
}

/// The run stage an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lock,
    Prepare,
    Task,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Lock => "lock",
            Stage::Prepare => "prepare",
            Stage::Task => "task",
            Stage::Publish => "publish",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Best-effort stage attribution for errors that carry their own stage.
    ///
    /// Wrapper variants (`Io`, `Git`, ...) return `None`; the runner knows
    /// which stage it was in when they surfaced.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::MissingSecret(_) | Error::Prepare(_) => Some(Stage::Prepare),
            Error::TaskFailed { .. } => Some(Stage::Task),
            Error::SyncConflict { .. } | Error::PushRejected(_) => Some(Stage::Publish),
            Error::LockTimeout { .. } => Some(Stage::Lock),
            Error::RunFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
