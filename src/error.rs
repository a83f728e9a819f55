//! Error types for the onboarding service.

use serde::Serialize;
use uuid::Uuid;

use crate::onboarding::state::Stage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Onboarding error: {0}")]
    Onboarding(#[from] OnboardingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures of the remote rescue service or one of its satellites.
///
/// Every variant is retryable from the applicant's point of view: the local
/// state that led to the call is kept.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },

    #[error("{service} rejected the request with status {status}: {body}")]
    Rejected {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("Authentication failed for {service}")]
    AuthFailed { service: String },
}

/// A field-level validation failure, reported inline next to the field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Onboarding workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum OnboardingError {
    #[error("Cannot leave stage {stage}: {reason}")]
    TransitionBlocked { stage: Stage, reason: String },

    #[error("Stage {target} has not been reached yet (current stage: {current})")]
    StageNotReached { current: Stage, target: Stage },

    #[error("Operation requires stage {expected}, applicant is at {actual}")]
    WrongStage { expected: Stage, actual: Stage },

    #[error("Onboarding is already complete")]
    AlreadyComplete,

    #[error("Validation failed for {} field(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown skill: {0}")]
    UnknownSkill(String),

    #[error("Unknown certificate type: {0}")]
    UnknownCertType(String),

    #[error("Question {index} is not the current question (current: {current})")]
    WrongQuestion { index: usize, current: usize },

    #[error("Prerequisite answers were already submitted and can no longer change")]
    ConsentLocked,

    #[error("Not every prerequisite question has been answered yes")]
    ConsentIncomplete,

    #[error("Document {0} not found")]
    DocumentNotFound(Uuid),

    #[error("Document {0} is still uploading")]
    DocumentUploading(Uuid),

    #[error("{count} document upload(s) still in progress")]
    UploadsOutstanding { count: usize },
}
