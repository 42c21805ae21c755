//! Core error types for the Rowe platform.
//!
//! `ServerError` is used throughout the store/API plane; the HTTP adapter
//! maps it into the response envelope via its stable `code()`.
//!
//! Task-level failures are a separate concern: `TaskFailure` classifies what
//! went wrong while running one task so the scheduler can decide between
//! retry and permanent failure. It is serialized into the task row.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed")]
    Validation(Vec<String>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable machine-readable code for the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Database(_) | ServerError::Internal(_) => "internal",
            ServerError::NotFound(_) => "not_found",
            ServerError::BadRequest(_) | ServerError::Validation(_) => "validation",
            ServerError::Conflict(_) => "conflict",
            ServerError::Unauthorized(_) => "unauthorized",
        }
    }

    /// The per-error detail list surfaced to clients. Validation errors carry
    /// every problem found, not just the first.
    pub fn details(&self) -> Vec<String> {
        match self {
            ServerError::Validation(errors) => errors.clone(),
            _ => Vec::new(),
        }
    }
}

/// Why a task failed. The scheduler consults `retryable()` when deciding
/// whether a FAILED task moves to RETRYING.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    #[error("expression error in `{expr}`: {message}")]
    Expression { expr: String, message: String },

    #[error("staging error: {message}")]
    Staging { message: String, transient: bool },

    #[error("execution error: {message}")]
    Exec { message: String, transient: bool },

    #[error("command exited with code {code}")]
    ExitCode { code: i32, transient: bool },

    #[error("tool exceeded its time limit of {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("output collection error: {message}")]
    OutputCollection { message: String },

    #[error("remote service error: {message}")]
    Remote { message: String, transient: bool },
}

impl TaskFailure {
    pub fn retryable(&self) -> bool {
        match self {
            TaskFailure::Expression { .. } => false,
            TaskFailure::Staging { transient, .. } => *transient,
            TaskFailure::Exec { transient, .. } => *transient,
            TaskFailure::ExitCode { transient, .. } => *transient,
            TaskFailure::Timeout { .. } => true,
            TaskFailure::OutputCollection { .. } => false,
            TaskFailure::Remote { transient, .. } => *transient,
        }
    }
}
