//! Error types for volstore

use thiserror::Error;

/// Result type alias for volstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to parse {what} '{input}': {reason}")]
    Parse {
        what: &'static str,
        input: String,
        reason: String,
    },

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("unable to allocate an image name for guest {0} - all disk slots are in use")]
    NoFreeSlot(u32),

    #[error("can't rollback, '{requested}' is not most recent snapshot (latest is '{latest}')")]
    NotLatestSnapshot { requested: String, latest: String },

    #[error("volume '{0}' is already a base image")]
    AlreadyBase(String),

    #[error("illegal name '{name}' - {reason}")]
    InvalidName { name: String, reason: String },

    #[error("timeout while waiting for {0}")]
    Timeout(String),

    #[error("Command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("{tool} error: {message}")]
    BackendToolFailure { tool: &'static str, message: String },

    #[error("stream format error: {0}")]
    StreamFormat(String),

    #[error("can't lock storage '{0}' - got timeout")]
    LockTimeout(String),

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn parse(what: &'static str, input: &str, reason: impl Into<String>) -> Self {
        Error::Parse {
            what,
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from(err))
    }
}
