pub mod models;
pub mod pii;

pub use models::events::{BookingEvent, BookingEventKind, EventEnvelope};
pub use pii::Masked;
