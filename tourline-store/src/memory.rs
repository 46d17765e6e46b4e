use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tourline_core::models::{
    Booking, BookingStatus, Departure, DepartureStatus, Passenger, PriceQuote, Transaction,
    TransactionStatus,
};
use tourline_core::repository::{
    OutboxStore, PricingCatalog, SeatReservation, Store, StoreTx,
};
use tourline_core::{CoreError, CoreResult};
use tourline_shared::EventEnvelope;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    departures: HashMap<Uuid, Departure>,
    bookings: HashMap<Uuid, Booking>,
    passengers: Vec<Passenger>,
    transactions: HashMap<Uuid, Transaction>,
    outbox: Vec<OutboxEntry>,
}

#[derive(Debug, Clone)]
struct OutboxEntry {
    envelope: EventEnvelope,
    dispatched_at: Option<DateTime<Utc>>,
}

/// In-process store for tests and local development. Units of work are
/// serialized behind one async mutex and roll back to a snapshot when
/// dropped without commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    prices: Arc<RwLock<HashMap<Uuid, PriceQuote>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a departure together with its per-seat prices.
    pub async fn insert_departure(&self, departure: Departure, quote: PriceQuote) {
        self.prices.write().await.insert(departure.id, quote);
        self.state.lock().await.departures.insert(departure.id, departure);
    }

    pub async fn departure(&self, id: Uuid) -> Option<Departure> {
        self.state.lock().await.departures.get(&id).cloned()
    }

    pub async fn booking(&self, id: Uuid) -> Option<Booking> {
        self.state.lock().await.bookings.get(&id).cloned()
    }

    pub async fn bookings_for_departure(&self, departure_id: Uuid) -> Vec<Booking> {
        self.state
            .lock()
            .await
            .bookings
            .values()
            .filter(|b| b.departure_id == departure_id)
            .cloned()
            .collect()
    }

    pub async fn transaction_by_code(&self, code: &str) -> Option<Transaction> {
        self.state
            .lock()
            .await
            .transactions
            .values()
            .find(|t| t.internal_code == code)
            .cloned()
    }

    pub async fn transactions_for_booking(&self, booking_id: Uuid) -> Vec<Transaction> {
        self.state
            .lock()
            .await
            .transactions
            .values()
            .filter(|t| t.booking_id == Some(booking_id))
            .cloned()
            .collect()
    }

    pub async fn events(&self) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .map(|entry| entry.envelope.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    // `None` once committed.
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_departure(&mut self, id: Uuid) -> CoreResult<Option<Departure>> {
        Ok(self.guard.departures.get(&id).cloned())
    }

    async fn try_reserve_seats(&mut self, id: Uuid, seats: u32) -> CoreResult<SeatReservation> {
        let Some(departure) = self.guard.departures.get_mut(&id) else {
            return Ok(SeatReservation::Missing);
        };
        if !departure.status.is_reservable() {
            return Ok(SeatReservation::NotReservable(departure.status));
        }
        if seats > departure.free_seats() {
            return Ok(SeatReservation::Insufficient {
                free_seats: departure.free_seats(),
            });
        }

        departure.reserved_seats += seats;
        if departure.reserved_seats == departure.capacity {
            departure.status = DepartureStatus::Full;
        }
        departure.updated_at = Utc::now();
        Ok(SeatReservation::Reserved(departure.clone()))
    }

    async fn release_seats(&mut self, id: Uuid, seats: u32) -> CoreResult<Option<Departure>> {
        let Some(departure) = self.guard.departures.get_mut(&id) else {
            return Ok(None);
        };
        departure.reserved_seats = departure.reserved_seats.saturating_sub(seats);
        if departure.status == DepartureStatus::Full && departure.reserved_seats < departure.capacity {
            departure.status = DepartureStatus::HasSpace;
        }
        departure.updated_at = Utc::now();
        Ok(Some(departure.clone()))
    }

    async fn insert_booking(&mut self, booking: &Booking) -> CoreResult<()> {
        if self.guard.bookings.contains_key(&booking.id) {
            return Err(CoreError::InternalError(format!("duplicate booking id {}", booking.id)));
        }
        self.guard.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn find_booking(&mut self, id: Uuid) -> CoreResult<Option<Booking>> {
        Ok(self.guard.bookings.get(&id).cloned())
    }

    async fn update_booking_status(
        &mut self,
        id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        refund_amount: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        let Some(booking) = self.guard.bookings.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&booking.status) {
            return Ok(None);
        }
        booking.status = to;
        booking.updated_at = at;
        if to == BookingStatus::Cancelled {
            booking.cancelled_at = Some(at);
            booking.refund_amount = refund_amount;
        }
        Ok(Some(booking.clone()))
    }

    async fn list_passengers(&mut self, booking_id: Uuid) -> CoreResult<Vec<Passenger>> {
        Ok(self
            .guard
            .passengers
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_passengers(&mut self, passengers: &[Passenger]) -> CoreResult<()> {
        self.guard.passengers.extend_from_slice(passengers);
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> CoreResult<()> {
        if self
            .guard
            .transactions
            .values()
            .any(|t| t.internal_code == transaction.internal_code)
        {
            return Err(CoreError::InternalError(format!(
                "duplicate transaction code {}",
                transaction.internal_code
            )));
        }
        self.guard.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn find_transaction_by_code(&mut self, code: &str) -> CoreResult<Option<Transaction>> {
        Ok(self
            .guard
            .transactions
            .values()
            .find(|t| t.internal_code == code)
            .cloned())
    }

    async fn lock_transaction(&mut self, id: Uuid) -> CoreResult<Option<Transaction>> {
        Ok(self.guard.transactions.get(&id).cloned())
    }

    async fn find_awaiting_transaction(
        &mut self,
        booking_id: Uuid,
        since: DateTime<Utc>,
    ) -> CoreResult<Option<Transaction>> {
        Ok(self
            .guard
            .transactions
            .values()
            .filter(|t| {
                t.booking_id == Some(booking_id)
                    && t.status == TransactionStatus::AwaitingPayment
                    && t.created_at >= since
            })
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        gateway_reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<Transaction>> {
        if status == TransactionStatus::Succeeded {
            let booking_id = self.guard.transactions.get(&id).and_then(|t| t.booking_id);
            let other_succeeded = self.guard.transactions.values().any(|t| {
                t.id != id && t.booking_id.is_some() && t.booking_id == booking_id
                    && t.status == TransactionStatus::Succeeded
            });
            if other_succeeded {
                return Err(CoreError::InvalidState(
                    "booking already has a succeeded transaction".to_string(),
                ));
            }
        }

        let Some(transaction) = self.guard.transactions.get_mut(&id) else {
            return Ok(None);
        };
        if transaction.status == TransactionStatus::Succeeded || transaction.status == status {
            return Ok(None);
        }
        transaction.status = status;
        if let Some(reference) = gateway_reference {
            transaction.gateway_reference = Some(reference.to_string());
        }
        transaction.updated_at = at;
        Ok(Some(transaction.clone()))
    }

    async fn enqueue_event(&mut self, envelope: &EventEnvelope) -> CoreResult<()> {
        self.guard.outbox.push(OutboxEntry {
            envelope: envelope.clone(),
            dispatched_at: None,
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> CoreResult<()> {
        self.snapshot = None;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn pending_events(&self, limit: usize) -> CoreResult<Vec<EventEnvelope>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|entry| entry.dispatched_at.is_none())
            .take(limit)
            .map(|entry| entry.envelope.clone())
            .collect())
    }

    async fn mark_dispatched(&self, ids: &[Uuid], at: DateTime<Utc>) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        for entry in state.outbox.iter_mut() {
            if ids.contains(&entry.envelope.id) {
                entry.dispatched_at = Some(at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PricingCatalog for MemoryStore {
    async fn quote(&self, departure: &Departure) -> CoreResult<PriceQuote> {
        self.prices
            .read()
            .await
            .get(&departure.id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("price", departure.id))
    }
}
