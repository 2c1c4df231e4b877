use crate::comment::CommentState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("stale file {path}: patch was computed against {expected} but file is now {actual}")]
    StaleFile {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("malformed patch: {reason}")]
    MalformedPatch { reason: String },
    #[error("patch does not apply to {path}\n{diagnostic}")]
    ApplyConflict { path: String, diagnostic: String },
    #[error("oracle call failed: {0}")]
    Oracle(String),
    #[error("comment #{id} is in state '{state}'; only analyzed comments can be applied")]
    StateConflict { id: u64, state: CommentState },
    #[error("invalid issue metadata: {reason}")]
    InvalidMetadata { reason: String },
    #[error("GitHub API request failed with status {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
