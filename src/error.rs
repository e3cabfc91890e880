use std::time::Duration;
use thiserror::Error;
use crate::task::Command;

/// Protocol-level failures.
///
/// Transport blips and hash divergence are absorbed (logged) by the layers
/// that see them; the variants here are what actually propagates.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("task {instance_id} is locked by {holder}")]
    LockConflict { instance_id: String, holder: String },

    #[error("unknown state '{state}' for task definition '{definition}'")]
    UnknownState { definition: String, state: String },

    #[error("unexpected command change on {instance_id}: {pending} -> {attempted}")]
    CommandRegression {
        instance_id: String,
        pending: Command,
        attempted: Command,
    },

    #[error("remote task error: {0}")]
    RemoteTask(String),

    #[error("task {instance_id} did not mount within {timeout:?}")]
    MountTimeout { instance_id: String, timeout: Duration },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("no behavior registered for '{0}'")]
    UnknownBehavior(String),

    #[error("instance {0} is not mounted")]
    NotMounted(String),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors that end a task instance. The rest are logged and absorbed.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::Transport(_)
                | SyncError::LockConflict { .. }
                | SyncError::RemoteTask(_)
                | SyncError::InvalidPatch(_)
                | SyncError::Protocol(_)
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
