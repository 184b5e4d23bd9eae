//! Error types for braid.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workflow {id} version {version:?} is not registered")]
    NotRegistered { id: String, version: Option<i32> },

    #[error("workflow {id} version {version} is already registered")]
    DuplicateDefinition { id: String, version: i32 },

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("step {step_id} does not exist in definition {definition_id}")]
    UnknownStep { definition_id: String, step_id: i32 },

    #[error("cannot resolve step body {0}")]
    UnresolvableBody(String),

    #[error("corrupt persistence data on pointer {0}")]
    CorruptPersistenceData(String),

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("activity {0} reported failure")]
    ActivityFailed(String),

    #[error("activity token mismatch")]
    TokenMismatch,

    #[error("malformed activity token: {0}")]
    BadToken(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
