use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingCreatedEvent {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub departure_id: Uuid,
    pub seats: u32,
    pub total_amount: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingConfirmedEvent {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingCancelledEvent {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub departure_id: Uuid,
    pub seats_released: u32,
    pub refund_amount: Decimal,
    pub refund_percentage: u8,
    pub reason_code: String,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingPaidEvent {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub transaction_code: String,
    pub gateway_reference: Option<String>,
    pub amount: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct BookingCompletedEvent {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookingEventKind {
    Created,
    Confirmed,
    Cancelled,
    Paid,
    Completed,
}

impl BookingEventKind {
    /// Topic-level event type, also stored in the outbox `event_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingEventKind::Created => "booking.created",
            BookingEventKind::Confirmed => "booking.confirmed",
            BookingEventKind::Cancelled => "booking.cancelled",
            BookingEventKind::Paid => "booking.paid",
            BookingEventKind::Completed => "booking.completed",
        }
    }
}

/// A booking state change that downstream consumers (notifications, reporting) react to.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    Created(BookingCreatedEvent),
    Confirmed(BookingConfirmedEvent),
    Cancelled(BookingCancelledEvent),
    Paid(BookingPaidEvent),
    Completed(BookingCompletedEvent),
}

impl BookingEvent {
    pub fn kind(&self) -> BookingEventKind {
        match self {
            BookingEvent::Created(_) => BookingEventKind::Created,
            BookingEvent::Confirmed(_) => BookingEventKind::Confirmed,
            BookingEvent::Cancelled(_) => BookingEventKind::Cancelled,
            BookingEvent::Paid(_) => BookingEventKind::Paid,
            BookingEvent::Completed(_) => BookingEventKind::Completed,
        }
    }

    pub fn booking_id(&self) -> Uuid {
        match self {
            BookingEvent::Created(e) => e.booking_id,
            BookingEvent::Confirmed(e) => e.booking_id,
            BookingEvent::Cancelled(e) => e.booking_id,
            BookingEvent::Paid(e) => e.booking_id,
            BookingEvent::Completed(e) => e.booking_id,
        }
    }
}

/// Outbox row: an event persisted alongside the state change it describes,
/// waiting to be published by the dispatcher.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: String,
    pub booking_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn wrap(event: &BookingEvent, created_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event.kind().as_str().to_string(),
            booking_id: event.booking_id(),
            payload: serde_json::to_value(event)?,
            created_at,
        })
    }
}
