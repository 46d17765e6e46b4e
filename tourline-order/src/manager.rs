use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tourline_core::access::{Capability, Principal};
use tourline_core::capacity::CapacityLedger;
use tourline_core::clock::Clock;
use tourline_core::models::{
    Availability, Booking, BookingStatus, DepartureStatus, NewBooking, NewPassenger, Passenger,
    PassengerType,
};
use tourline_core::refund::{days_before_departure, RefundBreakdown, RefundPolicy};
use tourline_core::repository::{PricingCatalog, Store, StoreTx};
use tourline_core::{CoreError, CoreResult};
use tourline_shared::models::events::{
    BookingCancelledEvent, BookingCompletedEvent, BookingConfirmedEvent, BookingCreatedEvent,
};
use tourline_shared::{BookingEvent, EventEnvelope};
use tracing::{debug, info};
use uuid::Uuid;

/// A booking together with its attached passengers.
#[derive(Debug, Clone, Serialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub passengers: Vec<Passenger>,
}

/// Write `event` to the outbox inside the caller's unit of work.
pub(crate) async fn enqueue(tx: &mut dyn StoreTx, event: BookingEvent, at: DateTime<Utc>) -> CoreResult<()> {
    let envelope = EventEnvelope::wrap(&event, at)?;
    tx.enqueue_event(&envelope).await
}

/// Booking state machine authority: creation, passengers, cancellation and
/// the supplier-side transitions.
pub struct BookingManager {
    store: Arc<dyn Store>,
    pricing: Arc<dyn PricingCatalog>,
    refund_policy: RefundPolicy,
    clock: Arc<dyn Clock>,
}

impl BookingManager {
    pub fn new(
        store: Arc<dyn Store>,
        pricing: Arc<dyn PricingCatalog>,
        refund_policy: RefundPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pricing,
            refund_policy,
            clock,
        }
    }

    pub async fn check_availability(&self, departure_id: Uuid, seats: u32) -> CoreResult<Availability> {
        let mut tx = self.store.begin().await?;
        CapacityLedger::check_availability(tx.as_mut(), departure_id, seats).await
    }

    pub async fn create_booking(&self, principal: &Principal, request: NewBooking) -> CoreResult<Booking> {
        principal.require(Capability::BookTours)?;

        let seats = request
            .adults
            .checked_add(request.children)
            .ok_or_else(|| CoreError::InvalidArgument("too many seats requested".to_string()))?;
        if seats == 0 {
            return Err(CoreError::InvalidArgument(
                "a booking needs at least one adult or child".to_string(),
            ));
        }
        if request.payment_method.trim().is_empty() {
            return Err(CoreError::InvalidArgument("payment_method is required".to_string()));
        }

        let mut tx = self.store.begin().await?;

        let departure = tx
            .find_departure(request.departure_id)
            .await?
            .ok_or_else(|| CoreError::not_found("departure", request.departure_id))?;
        // `full` is left to the ledger, which reports it with the free-seat count.
        if !departure.status.is_reservable() && departure.status != DepartureStatus::Full {
            return Err(CoreError::InvalidState(format!(
                "departure {} is {}",
                departure.id, departure.status
            )));
        }

        let quote = self.pricing.quote(&departure).await?;

        if let Err(e) = CapacityLedger::reserve(tx.as_mut(), departure.id, seats).await {
            if let CoreError::InsufficientCapacity { free_seats, .. } = &e {
                info!(
                    "Rejected booking of {} seats on departure {}: {} free",
                    seats, departure.id, free_seats
                );
            }
            return Err(e);
        }

        let now = self.clock.now();
        let booking = Booking {
            id: Uuid::new_v4(),
            user_id: principal.user_id,
            departure_id: departure.id,
            adults: request.adults,
            children: request.children,
            total_amount: quote.total(request.adults, request.children),
            payment_method: request.payment_method.trim().to_string(),
            status: BookingStatus::PendingConfirmation,
            refund_amount: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        tx.insert_booking(&booking).await?;

        enqueue(
            tx.as_mut(),
            BookingEvent::Created(BookingCreatedEvent {
                booking_id: booking.id,
                user_id: booking.user_id,
                departure_id: booking.departure_id,
                seats,
                total_amount: booking.total_amount,
                timestamp: now.timestamp(),
            }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Booking {} created: {} seats on departure {}, total {}",
            booking.id, seats, booking.departure_id, booking.total_amount
        );
        Ok(booking)
    }

    pub async fn get_booking(&self, principal: &Principal, booking_id: Uuid) -> CoreResult<BookingDetails> {
        let mut tx = self.store.begin().await?;
        let booking = Self::load(tx.as_mut(), booking_id).await?;
        if !principal.can_view(booking.user_id) {
            return Err(CoreError::PermissionDenied(
                "resource belongs to another user".to_string(),
            ));
        }
        let passengers = tx.list_passengers(booking_id).await?;
        Ok(BookingDetails { booking, passengers })
    }

    /// Attach the full passenger list in one go. Counts per type must match
    /// the booking exactly.
    pub async fn add_passengers(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        passengers: Vec<NewPassenger>,
    ) -> CoreResult<Vec<Passenger>> {
        let mut tx = self.store.begin().await?;
        let booking = Self::load(tx.as_mut(), booking_id).await?;
        principal.require_owner(Capability::BookTours, booking.user_id)?;

        if booking.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "booking {} is {}",
                booking_id, booking.status
            )));
        }
        if !tx.list_passengers(booking_id).await?.is_empty() {
            return Err(CoreError::InvalidState(format!(
                "booking {} already has passengers",
                booking_id
            )));
        }

        let adults = passengers
            .iter()
            .filter(|p| p.passenger_type == PassengerType::Adult)
            .count();
        let children = passengers.len() - adults;
        if adults != booking.adults as usize || children != booking.children as usize {
            return Err(CoreError::InvalidArgument(format!(
                "expected {} adults and {} children, got {} and {}",
                booking.adults, booking.children, adults, children
            )));
        }
        if passengers.iter().any(|p| p.full_name.trim().is_empty()) {
            return Err(CoreError::InvalidArgument("passenger full_name is required".to_string()));
        }

        let now = self.clock.now();
        let rows: Vec<Passenger> = passengers
            .into_iter()
            .map(|p| Passenger {
                id: Uuid::new_v4(),
                booking_id,
                full_name: p.full_name.trim().to_string(),
                passenger_type: p.passenger_type,
                date_of_birth: p.date_of_birth,
                identity_number: p.identity_number,
                created_at: now,
            })
            .collect();
        tx.insert_passengers(&rows).await?;
        tx.commit().await?;

        debug!("Attached {} passengers to booking {}", rows.len(), booking_id);
        Ok(rows)
    }

    /// Cancel the booking, hand its seats back and report the refund owed.
    /// No money moves here.
    pub async fn cancel_booking(&self, principal: &Principal, booking_id: Uuid) -> CoreResult<RefundBreakdown> {
        let mut tx = self.store.begin().await?;
        let (booking, breakdown) = self.assess_cancellation(tx.as_mut(), principal, booking_id).await?;
        let now = self.clock.now();

        tx.update_booking_status(
            booking_id,
            &BookingStatus::CANCELLABLE,
            BookingStatus::Cancelled,
            Some(breakdown.refund_amount),
            now,
        )
        .await?
        .ok_or_else(|| CoreError::InvalidState(format!("booking {} can no longer be cancelled", booking_id)))?;

        let departure = CapacityLedger::release(tx.as_mut(), booking.departure_id, booking.seats()).await?;

        enqueue(
            tx.as_mut(),
            BookingEvent::Cancelled(BookingCancelledEvent {
                booking_id,
                user_id: booking.user_id,
                departure_id: booking.departure_id,
                seats_released: booking.seats(),
                refund_amount: breakdown.refund_amount,
                refund_percentage: breakdown.refund_percentage,
                reason_code: breakdown.reason_code.clone(),
                timestamp: now.timestamp(),
            }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Booking {} cancelled ({}), refund {} of {}; departure {} now {} with {} free",
            booking_id,
            breakdown.reason_code,
            breakdown.refund_amount,
            breakdown.total_amount,
            departure.id,
            departure.status,
            departure.free_seats()
        );
        Ok(breakdown)
    }

    /// What `cancel_booking` would refund right now. Read-only.
    pub async fn refund_preview(&self, principal: &Principal, booking_id: Uuid) -> CoreResult<RefundBreakdown> {
        let mut tx = self.store.begin().await?;
        let (_, breakdown) = self.assess_cancellation(tx.as_mut(), principal, booking_id).await?;
        Ok(breakdown)
    }

    pub async fn confirm_booking(&self, principal: &Principal, booking_id: Uuid) -> CoreResult<Booking> {
        principal.require(Capability::ManageBookings)?;
        let mut tx = self.store.begin().await?;
        let booking = Self::load(tx.as_mut(), booking_id).await?;
        let now = self.clock.now();

        let confirmed = Self::transition(tx.as_mut(), &booking, BookingStatus::Confirmed, now).await?;
        enqueue(
            tx.as_mut(),
            BookingEvent::Confirmed(BookingConfirmedEvent {
                booking_id,
                user_id: booking.user_id,
                timestamp: now.timestamp(),
            }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!("Booking {} confirmed by {}", booking_id, principal.user_id);
        Ok(confirmed)
    }

    pub async fn complete_booking(&self, principal: &Principal, booking_id: Uuid) -> CoreResult<Booking> {
        principal.require(Capability::ManageBookings)?;
        let mut tx = self.store.begin().await?;
        let booking = Self::load(tx.as_mut(), booking_id).await?;
        let now = self.clock.now();

        let completed = Self::transition(tx.as_mut(), &booking, BookingStatus::Completed, now).await?;
        enqueue(
            tx.as_mut(),
            BookingEvent::Completed(BookingCompletedEvent {
                booking_id,
                user_id: booking.user_id,
                timestamp: now.timestamp(),
            }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!("Booking {} completed", booking_id);
        Ok(completed)
    }

    /// Move `booking` along one edge of the state machine inside the caller's
    /// unit of work. Cancellation goes through `cancel_booking` instead.
    pub async fn transition(
        tx: &mut dyn StoreTx,
        booking: &Booking,
        to: BookingStatus,
        at: DateTime<Utc>,
    ) -> CoreResult<Booking> {
        if to == BookingStatus::Cancelled || !booking.status.can_transition_to(to) {
            return Err(CoreError::InvalidState(format!(
                "booking {} cannot move from {} to {}",
                booking.id, booking.status, to
            )));
        }

        tx.update_booking_status(booking.id, &[booking.status], to, None, at)
            .await?
            .ok_or_else(|| CoreError::InvalidState(format!("booking {} changed concurrently", booking.id)))
    }

    async fn load(tx: &mut dyn StoreTx, booking_id: Uuid) -> CoreResult<Booking> {
        tx.find_booking(booking_id)
            .await?
            .ok_or_else(|| CoreError::not_found("booking", booking_id))
    }

    async fn assess_cancellation(
        &self,
        tx: &mut dyn StoreTx,
        principal: &Principal,
        booking_id: Uuid,
    ) -> CoreResult<(Booking, RefundBreakdown)> {
        let booking = Self::load(tx, booking_id).await?;
        principal.require_owner(Capability::BookTours, booking.user_id)?;

        if booking.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "booking {} is already {}",
                booking_id, booking.status
            )));
        }

        let departure = tx
            .find_departure(booking.departure_id)
            .await?
            .ok_or_else(|| CoreError::not_found("departure", booking.departure_id))?;

        let days = days_before_departure(departure.departs_on, self.clock.now());
        let breakdown = self.refund_policy.refund(booking.total_amount, days);
        Ok((booking, breakdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use tourline_core::access::Role;
    use tourline_core::clock::FixedClock;
    use tourline_core::models::{Departure, PriceQuote};
    use tourline_store::MemoryStore;

    struct Fixture {
        store: MemoryStore,
        manager: Arc<BookingManager>,
        clock: Arc<FixedClock>,
        departure: Departure,
    }

    async fn fixture(capacity: u32, departs_on: NaiveDate) -> Fixture {
        let store = MemoryStore::new();
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()));
        let departure = Departure {
            id: Uuid::new_v4(),
            tour_id: Uuid::new_v4(),
            departs_on,
            returns_on: departs_on + Duration::days(4),
            capacity,
            reserved_seats: 0,
            status: DepartureStatus::HasSpace,
            notes: None,
            updated_at: clock.now(),
        };
        store
            .insert_departure(
                departure.clone(),
                PriceQuote {
                    adult_price: Decimal::new(400_000, 0),
                    child_price: Decimal::new(200_000, 0),
                },
            )
            .await;

        let manager = Arc::new(BookingManager::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            RefundPolicy::default(),
            clock.clone(),
        ));
        Fixture {
            store,
            manager,
            clock,
            departure,
        }
    }

    fn request(departure_id: Uuid, adults: u32, children: u32) -> NewBooking {
        NewBooking {
            departure_id,
            adults,
            children,
            payment_method: "vnpay".to_string(),
        }
    }

    fn customer() -> Principal {
        Principal::new(Uuid::new_v4(), Role::Customer)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bookings_never_overbook() {
        let f = fixture(2, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = f.manager.clone();
                let departure_id = f.departure.id;
                tokio::spawn(async move {
                    manager.create_booking(&customer(), request(departure_id, 2, 0)).await
                })
            })
            .collect();

        let mut successes = 0;
        let mut rejections = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(CoreError::InsufficientCapacity { free_seats: 0, .. }) => rejections += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((successes, rejections), (1, 1));

        let departure = f.store.departure(f.departure.id).await.unwrap();
        assert_eq!(departure.reserved_seats, 2);
        assert_eq!(departure.status, DepartureStatus::Full);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_racers_fill_exactly_to_capacity() {
        let f = fixture(7, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let manager = f.manager.clone();
                let departure_id = f.departure.id;
                tokio::spawn(async move {
                    manager
                        .create_booking(&customer(), request(departure_id, 1 + i % 2, 0))
                        .await
                })
            })
            .collect();

        let mut booked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(booking) => booked += booking.seats(),
                Err(CoreError::InsufficientCapacity { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let departure = f.store.departure(f.departure.id).await.unwrap();
        assert!(booked <= 7);
        assert_eq!(departure.reserved_seats, booked);
        let held: u32 = f
            .store
            .bookings_for_departure(f.departure.id)
            .await
            .iter()
            .map(|b| b.seats())
            .sum();
        assert_eq!(held, booked);
    }

    #[tokio::test]
    async fn test_huge_party_is_a_capacity_rejection() {
        let f = fixture(5, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;
        f.manager
            .create_booking(&customer(), request(f.departure.id, 1, 0))
            .await
            .unwrap();

        let err = f
            .manager
            .create_booking(&customer(), request(f.departure.id, u32::MAX, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientCapacity { requested: u32::MAX, free_seats: 4 }
        ));

        let departure = f.store.departure(f.departure.id).await.unwrap();
        assert_eq!(departure.reserved_seats, 1);
        assert_eq!(f.store.bookings_for_departure(f.departure.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_booking_prices_and_emits_event() {
        let f = fixture(10, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;
        let booking = f
            .manager
            .create_booking(&customer(), request(f.departure.id, 2, 1))
            .await
            .unwrap();

        assert_eq!(booking.status, BookingStatus::PendingConfirmation);
        assert_eq!(booking.total_amount, Decimal::new(1_000_000, 0));

        let events = f.store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "booking.created");
        assert_eq!(events[0].booking_id, booking.id);
    }

    #[tokio::test]
    async fn test_create_booking_validation() {
        let f = fixture(10, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;

        let err = f
            .manager
            .create_booking(&customer(), request(f.departure.id, 0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));

        let err = f
            .manager
            .create_booking(&customer(), request(Uuid::new_v4(), 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "departure", .. }));

        let supplier = Principal::new(Uuid::new_v4(), Role::Supplier);
        let err = f
            .manager
            .create_booking(&supplier, request(f.departure.id, 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));

        let mut closed = f.departure.clone();
        closed.id = Uuid::new_v4();
        closed.status = DepartureStatus::Cancelled;
        f.store
            .insert_departure(
                closed.clone(),
                PriceQuote {
                    adult_price: Decimal::ONE,
                    child_price: Decimal::ONE,
                },
            )
            .await;
        let err = f
            .manager
            .create_booking(&customer(), request(closed.id, 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        assert_eq!(f.store.departure(f.departure.id).await.unwrap().reserved_seats, 0);
        assert!(f.store.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_seats_and_reopens_departure() {
        let f = fixture(3, NaiveDate::from_ymd_opt(2026, 11, 7).unwrap()).await;
        let owner = customer();
        let booking = f
            .manager
            .create_booking(&owner, request(f.departure.id, 2, 1))
            .await
            .unwrap();
        assert_eq!(
            f.store.departure(f.departure.id).await.unwrap().status,
            DepartureStatus::Full
        );

        // 20 days out: 50% tier.
        let breakdown = f.manager.cancel_booking(&owner, booking.id).await.unwrap();
        assert_eq!(breakdown.days_before_departure, 20);
        assert_eq!(breakdown.refund_percentage, 50);
        assert_eq!(breakdown.refund_amount, Decimal::new(500_000, 0));
        assert_eq!(breakdown.reason_code, "partial_refund_50");

        let departure = f.store.departure(f.departure.id).await.unwrap();
        assert_eq!(departure.free_seats(), 3);
        assert_eq!(departure.status, DepartureStatus::HasSpace);

        let stored = f.store.booking(booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::Cancelled);
        assert_eq!(stored.refund_amount, Some(Decimal::new(500_000, 0)));
        assert!(stored.cancelled_at.is_some());

        let err = f.manager.cancel_booking(&owner, booking.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(f.store.departure(f.departure.id).await.unwrap().free_seats(), 3);
    }

    #[tokio::test]
    async fn test_cancel_requires_ownership() {
        let f = fixture(10, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;
        let booking = f
            .manager
            .create_booking(&customer(), request(f.departure.id, 1, 0))
            .await
            .unwrap();

        let err = f.manager.cancel_booking(&customer(), booking.id).await.unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
        assert_eq!(
            f.store.booking(booking.id).await.unwrap().status,
            BookingStatus::PendingConfirmation
        );
    }

    #[tokio::test]
    async fn test_refund_preview_is_read_only_and_tracks_clock() {
        let f = fixture(10, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;
        let owner = customer();
        let booking = f
            .manager
            .create_booking(&owner, request(f.departure.id, 1, 0))
            .await
            .unwrap();

        let early = f.manager.refund_preview(&owner, booking.id).await.unwrap();
        assert_eq!(early.refund_percentage, 100);

        f.clock.advance(Duration::days(40));
        let late = f.manager.refund_preview(&owner, booking.id).await.unwrap();
        assert_eq!(late.refund_percentage, 20);

        let stored = f.store.booking(booking.id).await.unwrap();
        assert_eq!(stored.status, BookingStatus::PendingConfirmation);
        assert_eq!(f.store.departure(f.departure.id).await.unwrap().reserved_seats, 1);
    }

    #[tokio::test]
    async fn test_passenger_counts_must_match() {
        let f = fixture(10, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;
        let owner = customer();
        let booking = f
            .manager
            .create_booking(&owner, request(f.departure.id, 1, 1))
            .await
            .unwrap();

        let passenger = |name: &str, passenger_type| NewPassenger {
            full_name: name.to_string(),
            passenger_type,
            date_of_birth: None,
            identity_number: None,
        };

        let err = f
            .manager
            .add_passengers(
                &owner,
                booking.id,
                vec![passenger("An", PassengerType::Adult), passenger("Binh", PassengerType::Adult)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));

        let added = f
            .manager
            .add_passengers(
                &owner,
                booking.id,
                vec![passenger("An", PassengerType::Adult), passenger("Chi", PassengerType::Child)],
            )
            .await
            .unwrap();
        assert_eq!(added.len(), 2);

        let details = f.manager.get_booking(&owner, booking.id).await.unwrap();
        assert_eq!(details.passengers.len(), 2);

        let err = f
            .manager
            .add_passengers(
                &owner,
                booking.id,
                vec![passenger("An", PassengerType::Adult), passenger("Chi", PassengerType::Child)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_supplier_confirms_and_completes() {
        let f = fixture(10, NaiveDate::from_ymd_opt(2026, 12, 1).unwrap()).await;
        let owner = customer();
        let supplier = Principal::new(Uuid::new_v4(), Role::Supplier);
        let booking = f
            .manager
            .create_booking(&owner, request(f.departure.id, 1, 0))
            .await
            .unwrap();

        let err = f.manager.confirm_booking(&owner, booking.id).await.unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));

        let confirmed = f.manager.confirm_booking(&supplier, booking.id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);

        // Not paid yet.
        let err = f.manager.complete_booking(&supplier, booking.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        assert!(f.manager.get_booking(&supplier, booking.id).await.is_ok());
        assert!(f.manager.get_booking(&customer(), booking.id).await.is_err());
    }
}
