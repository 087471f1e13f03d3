use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Snapshot could not be loaded. Always fatal for a run.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("snapshot not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("snapshot {} is not a valid item list: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session cookies in {} (log in and export cookies first)", .0.display())]
    Missing(PathBuf),
    #[error("cookie file {} is not valid: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cookie file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fetch collaborator failure. Recoverable per item.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {:.0}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to store download: {0}")]
    Io(#[from] std::io::Error),
}

/// Recognition collaborator failure. Recoverable per item.
#[derive(Debug, Error)]
pub enum RecognizeError {
    #[error("failed to start recognizer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("recognizer timed out after {:.0}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("recognizer exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("unreadable recognizer output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("recognizer reported: {0}")]
    Reported(String),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize run state: {0}")]
    Serialize(#[from] serde_json::Error),
}
