use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tourline_shared::EventEnvelope;
use uuid::Uuid;

use crate::models::{
    Booking, BookingStatus, Departure, DepartureStatus, Passenger, PriceQuote, Transaction,
    TransactionStatus,
};
use crate::CoreResult;

/// Outcome of the guarded seat increment.
#[derive(Debug, Clone)]
pub enum SeatReservation {
    Reserved(Departure),
    Insufficient { free_seats: u32 },
    NotReservable(DepartureStatus),
    Missing,
}

/// Entry point to the persistent store. Every core operation runs inside one
/// unit of work obtained from `begin`; dropping the unit without `commit`
/// discards all of its writes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>>;
}

/// A single atomic unit of work. Row-level primitives only; the ledgers and
/// managers compose them into the business operations.
#[async_trait]
pub trait StoreTx: Send {
    // Departures. Only the capacity ledger calls the seat mutators.
    async fn find_departure(&mut self, id: Uuid) -> CoreResult<Option<Departure>>;

    /// Add `seats` to the reserved counter iff the departure is reservable and
    /// `reserved + seats <= capacity`, flipping it to `full` when the counter
    /// reaches capacity. Check and write happen in one step.
    async fn try_reserve_seats(&mut self, id: Uuid, seats: u32) -> CoreResult<SeatReservation>;

    /// Subtract `seats` from the reserved counter, reverting `full` to
    /// `has_space`. Returns `None` if the departure does not exist.
    async fn release_seats(&mut self, id: Uuid, seats: u32) -> CoreResult<Option<Departure>>;

    // Bookings
    async fn insert_booking(&mut self, booking: &Booking) -> CoreResult<()>;

    /// Load a booking and lock it for the remainder of the unit.
    async fn find_booking(&mut self, id: Uuid) -> CoreResult<Option<Booking>>;

    /// Move a booking to `to` iff its current status is one of `from`.
    /// Returns the updated row, or `None` when the guard did not match.
    async fn update_booking_status(
        &mut self,
        id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        refund_amount: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>>;

    async fn list_passengers(&mut self, booking_id: Uuid) -> CoreResult<Vec<Passenger>>;

    async fn insert_passengers(&mut self, passengers: &[Passenger]) -> CoreResult<()>;

    // Transactions. Only the transaction ledger calls these.
    async fn insert_transaction(&mut self, transaction: &Transaction) -> CoreResult<()>;

    /// Resolve an internal code. Takes no lock: callers lock the booking
    /// first, then the transaction through `lock_transaction`.
    async fn find_transaction_by_code(&mut self, code: &str) -> CoreResult<Option<Transaction>>;

    /// Re-read a transaction and lock it for the remainder of the unit.
    async fn lock_transaction(&mut self, id: Uuid) -> CoreResult<Option<Transaction>>;

    /// Most recent `awaiting_payment` transaction for the booking created at or after `since`.
    async fn find_awaiting_transaction(
        &mut self,
        booking_id: Uuid,
        since: DateTime<Utc>,
    ) -> CoreResult<Option<Transaction>>;

    /// Set the status iff the current status is neither `succeeded` nor already `status`.
    /// Returns the updated row, or `None` when the guard did not match.
    async fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        gateway_reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<Transaction>>;

    // Outbox
    async fn enqueue_event(&mut self, envelope: &EventEnvelope) -> CoreResult<()>;

    async fn commit(self: Box<Self>) -> CoreResult<()>;
}

/// Read side of the transactional outbox, used by the event dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn pending_events(&self, limit: usize) -> CoreResult<Vec<EventEnvelope>>;

    async fn mark_dispatched(&self, ids: &[Uuid], at: DateTime<Utc>) -> CoreResult<()>;
}

/// Publishes outbox events to the notification side.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> CoreResult<()>;
}

/// Pricing/catalog lookup for a departure.
#[async_trait]
pub trait PricingCatalog: Send + Sync {
    async fn quote(&self, departure: &Departure) -> CoreResult<PriceQuote>;
}
