pub mod access;
pub mod capacity;
pub mod clock;
pub mod ledger;
pub mod models;
pub mod payment;
pub mod refund;
pub mod repository;

use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Insufficient capacity: requested {requested} seats, {free_seats} free")]
    InsufficientCapacity { requested: u32, free_seats: u32 },
    #[error("Gateway signature verification failed")]
    InvalidSignature,
    #[error("Amount mismatch: expected {expected}, gateway notified {notified}")]
    AmountMismatch { expected: Decimal, notified: Decimal },
    #[error("Already processed: {0}")]
    AlreadyProcessed(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound { entity, id: id.to_string() }
    }

    /// Whether the caller may safely retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InternalError(format!("serialization failed: {}", err))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
