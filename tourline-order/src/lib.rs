pub mod manager;
pub mod orchestrator;

pub use manager::{BookingDetails, BookingManager};
pub use orchestrator::{gateway_ack, PaymentOrchestrator, PaymentRequest, ReconcileOutcome, ReturnStatus};
