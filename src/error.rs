//! Typed error kinds shared by every component, per the error contract.
//!
//! Library code returns `Result<T, DockertreeError>` so the CLI and the RPC
//! surface can both serialize the same structured `{code, message, details}`
//! record; the CLI additionally wraps these in `eyre::Report` for
//! human-oriented, backtraced output.

use std::fmt;

use serde::Serialize;

/// A stable machine-readable error code, exposed verbatim in `--json` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    AlreadyExists,
    PreconditionFailed,
    Transform,
    VolumeCopyFailed,
    Runtime,
    Network,
    Integrity,
    Cancelled,
    Timeout,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Validation => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::PreconditionFailed => "precondition_failed",
            ErrorCode::Transform => "transform_error",
            ErrorCode::VolumeCopyFailed => "volume_copy_failed",
            ErrorCode::Runtime => "runtime_error",
            ErrorCode::Network => "network_error",
            ErrorCode::Integrity => "integrity_error",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Extra structured context for an error, surfaced under `--json`'s
/// `error.details` field. Kept as a plain string list rather than a nested
/// object since most detail payloads here are "these objects were left
/// behind" or "these branches failed" lists.
pub type ErrorDetails = Vec<String>;

#[derive(Debug, thiserror::Error)]
pub enum DockertreeError {
    #[error("{message}")]
    Validation {
        message: String,
        details: ErrorDetails,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        details: ErrorDetails,
    },

    #[error("already exists: {message}")]
    AlreadyExists {
        message: String,
        details: ErrorDetails,
    },

    #[error("precondition failed: {message}")]
    PreconditionFailed {
        message: String,
        details: ErrorDetails,
    },

    #[error("failed to transform compose file: {message}")]
    Transform {
        message: String,
        details: ErrorDetails,
    },

    #[error("volume copy failed: {message}")]
    VolumeCopyFailed {
        message: String,
        details: ErrorDetails,
    },

    #[error("{tool} exited with status {exit_code}: {stderr_tail}")]
    Runtime {
        tool: String,
        exit_code: i32,
        stderr_tail: String,
    },

    #[error("network error: {message}")]
    Network {
        message: String,
        details: ErrorDetails,
    },

    #[error("integrity error: {message}")]
    Integrity {
        message: String,
        details: ErrorDetails,
    },

    #[error("cancelled")]
    Cancelled { details: ErrorDetails },

    #[error("timed out after {elapsed_secs}s: {operation}")]
    Timeout { operation: String, elapsed_secs: u64 },

    /// Escape hatch for adapter failures we don't model as a distinct kind
    /// (e.g. I/O errors reading a file that should exist).
    #[error(transparent)]
    Other(#[from] eyre::Report),
}

impl DockertreeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, extra: impl IntoIterator<Item = String>) -> Self {
        let slot = match &mut self {
            Self::Validation { details, .. }
            | Self::NotFound { details, .. }
            | Self::AlreadyExists { details, .. }
            | Self::PreconditionFailed { details, .. }
            | Self::Transform { details, .. }
            | Self::VolumeCopyFailed { details, .. }
            | Self::Network { details, .. }
            | Self::Integrity { details, .. }
            | Self::Cancelled { details } => Some(details),
            _ => None,
        };
        if let Some(slot) = slot {
            slot.extend(extra);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::Validation,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::PreconditionFailed { .. } => ErrorCode::PreconditionFailed,
            Self::Transform { .. } => ErrorCode::Transform,
            Self::VolumeCopyFailed { .. } => ErrorCode::VolumeCopyFailed,
            Self::Runtime { .. } => ErrorCode::Runtime,
            Self::Network { .. } => ErrorCode::Network,
            Self::Integrity { .. } => ErrorCode::Integrity,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Other(_) => ErrorCode::Runtime,
        }
    }

    pub fn details(&self) -> ErrorDetails {
        match self {
            Self::Validation { details, .. }
            | Self::NotFound { details, .. }
            | Self::AlreadyExists { details, .. }
            | Self::PreconditionFailed { details, .. }
            | Self::Transform { details, .. }
            | Self::VolumeCopyFailed { details, .. }
            | Self::Network { details, .. }
            | Self::Integrity { details, .. }
            | Self::Cancelled { details } => details.clone(),
            Self::Runtime { stderr_tail, .. } => vec![stderr_tail.clone()],
            Self::Timeout { .. } | Self::Other(_) => Vec::new(),
        }
    }

    /// Process exit code per spec.md §6.1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::NotFound { .. } | Self::AlreadyExists { .. } => 1,
            Self::PreconditionFailed { .. } => 1,
            Self::Transform { .. } | Self::VolumeCopyFailed { .. } => 1,
            Self::Runtime { exit_code, .. } => *exit_code,
            Self::Network { .. } => 3,
            Self::Cancelled { .. } => 4,
            Self::Integrity { .. } => 5,
            Self::Timeout { .. } => 3,
            Self::Other(_) => 1,
        }
    }

    /// Structured record emitted under `--json`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code().to_string(),
            "message": self.to_string(),
            "details": self.details(),
        })
    }
}

pub type Result<T> = std::result::Result<T, DockertreeError>;
