use thiserror::Error;
use uuid::Uuid;

use crate::models::jobmodel::{ActorRole, JobStatus};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("{role:?} {actor_id:?} is not authorized to {operation} on job {job_id}")]
    Authorization {
        job_id: Uuid,
        actor_id: Option<Uuid>,
        role: ActorRole,
        operation: &'static str,
    },

    #[error("Cannot {operation} job {job_id} while it is {status}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security check failed: {0}")]
    Security(String),

    #[error("Job {0} was modified concurrently, reload and retry")]
    Conflict(Uuid),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Job {0} is already settled")]
    AlreadySettled(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    pub fn invalid_state(job_id: Uuid, status: JobStatus, operation: &'static str) -> Self {
        ServiceError::InvalidState { job_id, status, operation }
    }

    /// Stable machine-readable code for transport layers.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::JobNotFound(_) => "job_not_found",
            ServiceError::Authorization { .. } => "authorization_error",
            ServiceError::InvalidState { .. } => "invalid_state",
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Security(_) => "security_error",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::ExternalService(_) => "external_service_error",
            ServiceError::AlreadySettled(_) => "already_settled",
            ServiceError::Database(_) => "database_error",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Conflict(_) | ServiceError::ExternalService(_) | ServiceError::Database(_)
        )
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServiceError::Validation(errors.to_string())
    }
}
