// Service Errors
// Error taxonomy shared by the parser, provisioner, scheduler and aggregator

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by the matrix service.
///
/// Only [`ServiceError::Configuration`] is fatal for a whole run; it is raised
/// before any worker is acquired. Everything else is isolated to a single job
/// instance and recorded in its outcome.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("run timed out after {deadline:?}: {incomplete} job(s) did not report")]
    Timeout { deadline: Duration, incomplete: usize },

    #[error("run was cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error should abort a run before anything executes
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Yaml(_))
    }
}

/// How a provisioning failure should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionFailureKind {
    /// Network flakes, daemons slow to start: worth another attempt
    Transient,
    /// Authentication or permission problems: retrying cannot help
    Permission,
    /// The job cannot satisfy its provisioning config
    Configuration,
    /// The run was cancelled while provisioning
    Cancelled,
}

/// Environment provisioning failure for one worker
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("provisioning failed: {reason}")]
pub struct ProvisionError {
    pub reason: String,
    pub kind: ProvisionFailureKind,
}

impl ProvisionError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            kind: ProvisionFailureKind::Transient,
        }
    }

    pub fn permission(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            kind: ProvisionFailureKind::Permission,
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            kind: ProvisionFailureKind::Configuration,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            reason: "run cancelled during provisioning".to_string(),
            kind: ProvisionFailureKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProvisionFailureKind::Transient
    }
}
