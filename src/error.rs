//! Domain error taxonomy shared by the pool, dispatcher, and processor.

use crate::providers::ProviderError;

/// Errors surfaced to the route layer by gateway operations.
///
/// Opt-out blocks are deliberately absent: a blocked send is a business
/// outcome reported through [`crate::messaging::SendOutcome`], not an error.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed phone number or missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced number or assignment does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The number is not in the state the transition requires.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The reservation backing a claim has expired or never existed.
    #[error("gone: {0}")]
    Gone(String),

    /// The operation is blocked by policy (e.g. a locked premium number).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The upstream carrier failed.
    #[error("upstream provider failed: {0}")]
    BadGateway(#[from] ProviderError),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which column held the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },
}

impl GatewayError {
    /// HTTP status code the route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Gone(_) => 410,
            Self::BadGateway(_) => 502,
            Self::Database(_) | Self::InvalidEnum { .. } => 500,
        }
    }

    /// Whether the caller can recover by choosing differently or retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Gone(_) | Self::BadGateway(_)
        )
    }
}

/// Returns true when a database error is a unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}
