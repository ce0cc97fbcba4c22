use std::io;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("double percent-encoding detected")]
    DoubleEncoding,
    #[error("path traversal detected")]
    Traversal,
    #[error("file not found")]
    NotFound,
    #[error("file too large: {0} bytes exceeds limit")]
    FileTooLarge(u64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
}

/// Stable, payload-free outcome used by callers to pick a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    InvalidInput,
    DoubleEncoding,
    Traversal,
    NotFound,
    FileTooLarge,
    Io,
    InvalidConfig,
}

impl RejectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectionKind::InvalidInput => "invalid_input",
            RejectionKind::DoubleEncoding => "double_encoding",
            RejectionKind::Traversal => "traversal",
            RejectionKind::NotFound => "not_found",
            RejectionKind::FileTooLarge => "file_too_large",
            RejectionKind::Io => "io",
            RejectionKind::InvalidConfig => "invalid_config",
        }
    }

    /// Only filesystem failures may succeed on a later attempt with the same input.
    pub fn is_retryable(self) -> bool {
        matches!(self, RejectionKind::Io)
    }
}

impl SandboxError {
    pub fn kind(&self) -> RejectionKind {
        match self {
            SandboxError::InvalidInput(_) => RejectionKind::InvalidInput,
            SandboxError::DoubleEncoding => RejectionKind::DoubleEncoding,
            SandboxError::Traversal => RejectionKind::Traversal,
            SandboxError::NotFound => RejectionKind::NotFound,
            SandboxError::FileTooLarge(_) => RejectionKind::FileTooLarge,
            SandboxError::Io(_) => RejectionKind::Io,
            SandboxError::InvalidConfig(_) => RejectionKind::InvalidConfig,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
