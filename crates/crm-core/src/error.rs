use thiserror::Error;

/// Domain error taxonomy. The service edge maps each variant to a
/// transport status; inside the core only the variant matters.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<crm_policy::PolicyError> for CoreError {
    fn from(err: crm_policy::PolicyError) -> Self {
        match err {
            crm_policy::PolicyError::Forbidden(reason) => CoreError::Forbidden(reason),
        }
    }
}
