//! Error types for verisca-sync

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::model::SessionStatus;

/// Coarse classification used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input; rejected before any state mutation, never retried.
    Validation,
    /// Workflow violation (out-of-order transition, locked session).
    State,
    /// No reference curve for the requested condition.
    Lookup,
    /// Referenced entity is missing.
    Conflict,
    /// Network failure; the operation stays queued.
    Connectivity,
    /// Local or server persistence failure.
    Storage,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate sample number {sample_number} in session {session_id}")]
    DuplicateSampleNumber { session_id: Uuid, sample_number: u32 },

    #[error("Sample set is empty")]
    EmptySampleSet,

    #[error("Invalid measurement '{key}' on sample {sample_number}: {reason}")]
    InvalidMeasurement {
        sample_number: u32,
        key: String,
        reason: String,
    },

    #[error("Sample numbers are 1-based, got {0}")]
    InvalidSampleNumber(u32),

    #[error("Unknown growth stage: {0}")]
    UnknownGrowthStage(String),

    #[error("Session {0} has no growth stage set")]
    MissingGrowthStage(Uuid),

    #[error("Stress input is not a finite number: {0}")]
    InvalidStressInput(f64),

    #[error("Invalid state transition: session is {current}, requested {requested}")]
    InvalidStateTransition {
        current: SessionStatus,
        requested: SessionStatus,
    },

    #[error("Session {session_id} is locked ({status})")]
    SessionLocked {
        session_id: Uuid,
        status: SessionStatus,
    },

    #[error("No lookup entries for table '{table}' under condition '{condition}'")]
    UnknownCondition { table: String, condition: String },

    #[error("Claim not found: {0}")]
    ClaimNotFound(Uuid),

    #[error("Claim {claim_id} does not accept new sessions ({status})")]
    ClaimClosed { claim_id: Uuid, status: String },

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::DuplicateSampleNumber { .. }
            | Error::EmptySampleSet
            | Error::InvalidMeasurement { .. }
            | Error::InvalidSampleNumber(_)
            | Error::UnknownGrowthStage(_)
            | Error::MissingGrowthStage(_)
            | Error::InvalidStressInput(_) => ErrorCategory::Validation,
            Error::InvalidStateTransition { .. }
            | Error::SessionLocked { .. }
            | Error::ClaimClosed { .. } => ErrorCategory::State,
            Error::UnknownCondition { .. } => ErrorCategory::Lookup,
            Error::ClaimNotFound(_) | Error::SessionNotFound(_) => ErrorCategory::Conflict,
            Error::Storage(_) | Error::Json(_) | Error::Io(_) | Error::Internal(_) => {
                ErrorCategory::Storage
            }
        }
    }
}

/// Failures of a pull or push round trip.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server rejected request: HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Local(#[from] Error),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Connection(_) | SyncError::Timeout(_) | SyncError::Http { .. } => {
                ErrorCategory::Connectivity
            }
            SyncError::Protocol(_) => ErrorCategory::Conflict,
            SyncError::Local(e) => e.category(),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Local(Error::Storage(e))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::Protocol(e.to_string())
        } else {
            SyncError::Connection(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
