use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Availability, Departure, DepartureStatus};
use crate::repository::{SeatReservation, StoreTx};
use crate::{CoreError, CoreResult};

/// Tracks reserved-vs-available seats per departure. The only writer of a
/// departure's seat counter and of the `full`/`has_space` transitions.
pub struct CapacityLedger;

impl CapacityLedger {
    /// Can `requested` more seats be reserved right now?
    pub async fn check_availability(
        tx: &mut dyn StoreTx,
        departure_id: Uuid,
        requested: u32,
    ) -> CoreResult<Availability> {
        let departure = tx
            .find_departure(departure_id)
            .await?
            .ok_or_else(|| CoreError::not_found("departure", departure_id))?;

        if !departure.status.is_reservable() {
            return Err(CoreError::InvalidState(format!(
                "departure {} is {}",
                departure_id, departure.status
            )));
        }

        let free_seats = departure.free_seats();
        Ok(Availability {
            available: requested > 0 && requested <= free_seats,
            free_seats,
        })
    }

    /// Atomically take `seats` on the departure.
    pub async fn reserve(tx: &mut dyn StoreTx, departure_id: Uuid, seats: u32) -> CoreResult<Departure> {
        if seats == 0 {
            return Err(CoreError::InvalidArgument("cannot reserve zero seats".to_string()));
        }

        match tx.try_reserve_seats(departure_id, seats).await? {
            SeatReservation::Reserved(departure) => {
                debug!(
                    "Reserved {} seats on departure {} ({}/{})",
                    seats, departure_id, departure.reserved_seats, departure.capacity
                );
                if departure.free_seats() == 0 {
                    info!("Departure {} is now full", departure_id);
                }
                Ok(departure)
            }
            SeatReservation::Insufficient { free_seats } => Err(CoreError::InsufficientCapacity {
                requested: seats,
                free_seats,
            }),
            // A full departure is a capacity outcome: the caller gets the free-seat count.
            SeatReservation::NotReservable(DepartureStatus::Full) => Err(CoreError::InsufficientCapacity {
                requested: seats,
                free_seats: 0,
            }),
            SeatReservation::NotReservable(status) => Err(CoreError::InvalidState(format!(
                "departure {} is {}",
                departure_id, status
            ))),
            SeatReservation::Missing => Err(CoreError::not_found("departure", departure_id)),
        }
    }

    /// Hand `seats` back to the departure.
    pub async fn release(tx: &mut dyn StoreTx, departure_id: Uuid, seats: u32) -> CoreResult<Departure> {
        let departure = tx
            .release_seats(departure_id, seats)
            .await?
            .ok_or_else(|| CoreError::not_found("departure", departure_id))?;
        debug!(
            "Released {} seats on departure {} ({}/{}, {})",
            seats, departure_id, departure.reserved_seats, departure.capacity, departure.status
        );
        Ok(departure)
    }
}
