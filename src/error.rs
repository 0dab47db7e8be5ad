use std::path::PathBuf;
use thiserror::Error;

/// Failures of the transfer workflow, each mapped onto a process exit code.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Not a failure: a recording is running or about to start.
    #[error("transfer deferred: {0}")]
    GuardAbort(String),

    #[error("source recording not found: {0:?}")]
    SourceMissing(PathBuf),

    #[error("network share unavailable at {path:?}: {reason}")]
    ShareUnavailable { path: PathBuf, reason: String },

    #[error("insufficient space at {path:?}: {available} bytes available, {required} required")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("copy of {source_path:?} failed: {error}")]
    CopyError {
        source_path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("checksum mismatch for {dest:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        dest: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("HTSP server {addr} unreachable: {reason}")]
    HtspUnreachable { addr: String, reason: String },

    #[error("failed to send email: {0}")]
    MailSendFailure(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Process exit status contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed,
    Deferred,
    Config,
}

impl Status {
    pub const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Failed => 1,
            Self::Deferred => 2,
            Self::Config => 3,
        }
    }

    /// Keeps the most severe of two statuses; a deferral never hides a failure.
    pub fn worst(self, other: Status) -> Status {
        fn rank(status: Status) -> u8 {
            match status {
                Status::Ok => 0,
                Status::Deferred => 1,
                Status::Failed => 2,
                Status::Config => 3,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }
}

impl TransferError {
    pub fn status(&self) -> Status {
        match self {
            Self::GuardAbort(_) => Status::Deferred,
            Self::ConfigError(_) => Status::Config,
            _ => Status::Failed,
        }
    }
}
