use std::fmt;

use thiserror::Error;

/// High-level error type shared across artifactman components.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("unprocessable entity: {message}")]
    Unprocessable {
        message: String,
        diagnostics: Vec<String>,
        status: Option<u16>,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("workspace error: {0}")]
    Workspace(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ArtifactError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ArtifactError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl ArtifactError {
    /// Builds an unprocessable error without upstream diagnostics.
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::Unprocessable {
            message: message.into(),
            diagnostics: Vec::new(),
            status: None,
        }
    }

    /// Builds an unprocessable error that carries the upstream HTTP status and diagnostics.
    pub fn upstream(message: impl Into<String>, status: Option<u16>, diagnostics: Vec<String>) -> Self {
        Self::Unprocessable {
            message: message.into(),
            diagnostics,
            status,
        }
    }

    /// HTTP status a dispatch layer should report for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ArtifactError::Validation(_) => 400,
            ArtifactError::Precondition(_) => 412,
            ArtifactError::Unprocessable { .. } => 422,
            ArtifactError::NotFound(_) => 404,
            ArtifactError::Workspace(_)
            | ArtifactError::Serialization(_)
            | ArtifactError::Template(_)
            | ArtifactError::Io(_) => 500,
        }
    }

    pub fn context<T: fmt::Display>(self, ctx: T) -> Self {
        match self {
            ArtifactError::Validation(msg) => ArtifactError::Validation(format!("{ctx}: {msg}")),
            ArtifactError::Precondition(msg) => ArtifactError::Precondition(format!("{ctx}: {msg}")),
            ArtifactError::Unprocessable {
                message,
                diagnostics,
                status,
            } => ArtifactError::Unprocessable {
                message: format!("{ctx}: {message}"),
                diagnostics,
                status,
            },
            ArtifactError::NotFound(msg) => ArtifactError::NotFound(format!("{ctx}: {msg}")),
            ArtifactError::Workspace(msg) => ArtifactError::Workspace(format!("{ctx}: {msg}")),
            ArtifactError::Serialization(msg) => {
                ArtifactError::Serialization(format!("{ctx}: {msg}"))
            }
            ArtifactError::Template(msg) => ArtifactError::Template(format!("{ctx}: {msg}")),
            ArtifactError::Io(err) => ArtifactError::Io(err),
        }
    }
}

pub type Result<T, E = ArtifactError> = std::result::Result<T, E>;
