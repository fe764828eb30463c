//! Error types for multipart upload operations

use crate::types::SessionState;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for multipart upload operations
pub type MpuResult<T> = Result<T, MpuError>;

/// Coarse classification of every error the engine can surface.
///
/// The retry layer only ever looks at this classification, never at
/// individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input; fatal
    Validation,
    /// Credentials rejected; fatal
    Authentication,
    /// Network or service hiccup; retried
    Transient,
    /// Operation invalid for the current session state; fatal
    StateConflict,
    /// Data corrupted in transit; retried as a fresh upload
    Integrity,
    /// Quota or policy refusal; fatal
    ServiceCapacity,
    /// Retry budget spent
    Exhausted,
    /// Caller cancelled the operation
    Cancelled,
}

/// Errors that can occur during multipart upload operations
#[derive(Error, Debug, Clone)]
pub enum MpuError {
    /// Target object path is malformed
    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    /// Input rejected before reaching the service
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Durability level or other policy rejected by the service
    #[error("Policy rejected: {0}")]
    PolicyRejected(String),

    /// Service temporarily unable to handle the request
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Transport-level failure (connection, timeout, broken stream)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials missing or rejected
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Part upload attempted against a session that is no longer open
    #[error("Session {session_id} is closed for uploads (state: {state})")]
    SessionClosed {
        session_id: String,
        state: SessionState,
    },

    /// Commit attempted against a session that is no longer open
    #[error("Session {session_id} is not open (state: {state})")]
    SessionNotOpen {
        session_id: String,
        state: SessionState,
    },

    /// Abort attempted against a committed session
    #[error("Session {session_id} is already committed")]
    AlreadyCommitted { session_id: String },

    /// Commit ordering references a part that is not currently uploaded
    #[error("Part {identifier} is not an uploaded part of session {session_id}")]
    MissingPart {
        session_id: String,
        identifier: String,
    },

    /// Service-reported checksum differs from the locally computed one
    #[error("Checksum mismatch for part {part_number}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        part_number: u32,
        expected: String,
        actual: String,
    },

    /// Part body length differs from the declared or service-reported size
    #[error("Size mismatch for part {part_number}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        part_number: u32,
        expected: u64,
        actual: u64,
    },

    /// Storage quota exceeded
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Service answered with something the client cannot interpret
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Local part data could not be opened or read; never retried.
    ///
    /// A body stream that breaks mid-request surfaces as `Transport` instead.
    #[error("I/O error: {0}")]
    Io(String),

    /// Operation stopped by a cancellation signal
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Retry budget exhausted
    #[error("{operation} failed after {attempts} attempts over {elapsed:?}: {last}")]
    ExhaustedRetries {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last: Box<MpuError>,
    },

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<MpuError>,
    },
}

impl MpuError {
    /// Add context to an error
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        MpuError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root_cause(&self) -> &MpuError {
        match self {
            MpuError::WithContext { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Classify the error according to the engine's failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            MpuError::InvalidPath(_)
            | MpuError::Validation(_)
            | MpuError::InvalidConfig(_)
            | MpuError::InvalidResponse(_)
            | MpuError::Io(_) => ErrorClass::Validation,
            MpuError::Authentication(_) => ErrorClass::Authentication,
            MpuError::ServiceUnavailable(_) | MpuError::Transport(_) => ErrorClass::Transient,
            MpuError::SessionClosed { .. }
            | MpuError::SessionNotOpen { .. }
            | MpuError::AlreadyCommitted { .. }
            | MpuError::MissingPart { .. } => ErrorClass::StateConflict,
            MpuError::ChecksumMismatch { .. } | MpuError::SizeMismatch { .. } => {
                ErrorClass::Integrity
            }
            MpuError::PolicyRejected(_) | MpuError::QuotaExceeded(_) => {
                ErrorClass::ServiceCapacity
            }
            MpuError::ExhaustedRetries { .. } => ErrorClass::Exhausted,
            MpuError::Cancelled(_) => ErrorClass::Cancelled,
            MpuError::WithContext { source, .. } => source.class(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Integrity)
    }

    /// Check if error is transient (network or service hiccup)
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Session state observed when a state-conflict error was raised
    pub fn observed_state(&self) -> Option<SessionState> {
        match self.root_cause() {
            MpuError::SessionClosed { state, .. } | MpuError::SessionNotOpen { state, .. } => {
                Some(*state)
            }
            MpuError::AlreadyCommitted { .. } => Some(SessionState::Committed),
            _ => None,
        }
    }
}

impl From<io::Error> for MpuError {
    fn from(err: io::Error) -> Self {
        MpuError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MpuError {
    fn from(err: serde_json::Error) -> Self {
        MpuError::InvalidResponse(err.to_string())
    }
}
