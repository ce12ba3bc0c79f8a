use std::path::PathBuf;

use thiserror::Error;

use crate::state_machine::InvalidTransition;

#[derive(Debug, Error)]
pub enum GbatchError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Session not found: {0}. Run `gbatch start` first.")]
    SessionNotFound(String),

    #[error("Unit '{key}' not found in session '{session}'")]
    UnitNotFound { session: String, key: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GbatchError {
    /// Process exit code for a run-fatal error.
    pub fn exit_code(&self) -> u8 {
        match self {
            GbatchError::Configuration(_) => 2,
            _ => 1,
        }
    }
}

/// Failures of the session store. Always fatal for the current run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid session name '{0}'")]
    InvalidSessionName(String),

    #[error("invalid unit key '{0}'")]
    InvalidKey(String),

    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// The input collaborator could not be enumerated.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot read input root {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("input name is not valid UTF-8: {0}")]
    NonUtf8Name(PathBuf),

    #[error("duplicate unit key '{key}' from {first} and {second}")]
    DuplicateKey {
        key: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("invalid pattern '{0}'")]
    InvalidPattern(String),
}
