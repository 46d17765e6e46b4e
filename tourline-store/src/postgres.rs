use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use tourline_core::models::{
    Booking, BookingStatus, Departure, DepartureStatus, Passenger, PriceQuote, Transaction,
    TransactionStatus,
};
use tourline_core::repository::{
    OutboxStore, PricingCatalog, SeatReservation, Store, StoreTx,
};
use tourline_core::{CoreError, CoreResult};
use tourline_shared::EventEnvelope;
use tracing::error;
use uuid::Uuid;

const DEPARTURE_COLUMNS: &str =
    "id, tour_id, departs_on, returns_on, capacity, reserved_seats, status, notes, updated_at";
const BOOKING_COLUMNS: &str = "id, user_id, departure_id, adults, children, total_amount, payment_method, status, refund_amount, cancelled_at, created_at, updated_at";
const TRANSACTION_COLUMNS: &str = "id, booking_id, user_id, internal_code, gateway_id, amount, status, gateway_reference, created_at, updated_at";

pub(crate) fn db_err(err: sqlx::Error) -> CoreError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            CoreError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            CoreError::InvalidState(format!("conflicting write: {}", db.message()))
        }
        sqlx::Error::Database(db) if db.code().is_some_and(|code| is_transient_sqlstate(&code)) => {
            CoreError::Unavailable(format!("transaction aborted: {}", db.message()))
        }
        _ => {
            error!("Database error: {}", err);
            CoreError::InternalError(err.to_string())
        }
    }
}

/// Deadlock and serialization failures: the whole unit may be retried.
fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40P01" | "40001")
}

fn to_u32(value: i32, column: &str) -> CoreResult<u32> {
    u32::try_from(value)
        .map_err(|_| CoreError::InternalError(format!("negative value in column {}", column)))
}

fn to_i32(value: u32) -> CoreResult<i32> {
    i32::try_from(value)
        .map_err(|_| CoreError::InvalidArgument(format!("value {} out of range", value)))
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct DepartureRow {
    id: Uuid,
    tour_id: Uuid,
    departs_on: NaiveDate,
    returns_on: NaiveDate,
    capacity: i32,
    reserved_seats: i32,
    status: String,
    notes: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DepartureRow> for Departure {
    type Error = CoreError;

    fn try_from(row: DepartureRow) -> CoreResult<Self> {
        Ok(Departure {
            id: row.id,
            tour_id: row.tour_id,
            departs_on: row.departs_on,
            returns_on: row.returns_on,
            capacity: to_u32(row.capacity, "capacity")?,
            reserved_seats: to_u32(row.reserved_seats, "reserved_seats")?,
            status: row.status.parse()?,
            notes: row.notes,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BookingRow {
    id: Uuid,
    user_id: Uuid,
    departure_id: Uuid,
    adults: i32,
    children: i32,
    total_amount: Decimal,
    payment_method: String,
    status: String,
    refund_amount: Option<Decimal>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = CoreError;

    fn try_from(row: BookingRow) -> CoreResult<Self> {
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            departure_id: row.departure_id,
            adults: to_u32(row.adults, "adults")?,
            children: to_u32(row.children, "children")?,
            total_amount: row.total_amount,
            payment_method: row.payment_method,
            status: row.status.parse()?,
            refund_amount: row.refund_amount,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PassengerRow {
    id: Uuid,
    booking_id: Uuid,
    full_name: String,
    passenger_type: String,
    date_of_birth: Option<NaiveDate>,
    identity_number: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PassengerRow> for Passenger {
    type Error = CoreError;

    fn try_from(row: PassengerRow) -> CoreResult<Self> {
        Ok(Passenger {
            id: row.id,
            booking_id: row.booking_id,
            full_name: row.full_name,
            passenger_type: row.passenger_type.parse()?,
            date_of_birth: row.date_of_birth,
            identity_number: row.identity_number,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    booking_id: Option<Uuid>,
    user_id: Uuid,
    internal_code: String,
    gateway_id: String,
    amount: Decimal,
    status: String,
    gateway_reference: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = CoreError;

    fn try_from(row: TransactionRow) -> CoreResult<Self> {
        Ok(Transaction {
            id: row.id,
            booking_id: row.booking_id,
            user_id: row.user_id,
            internal_code: row.internal_code,
            gateway_id: row.gateway_id,
            amount: row.amount,
            status: row.status.parse()?,
            gateway_reference: row.gateway_reference,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    event_type: String,
    booking_id: Uuid,
    payload: Value,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PriceRow {
    adult_price: Decimal,
    child_price: Decimal,
}

/// Postgres-backed store. Every unit of work is one database transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

pub struct PgStoreTx {
    tx: PgTransaction<'static, Postgres>,
}

impl PgStoreTx {
    async fn select_departure(&mut self, id: Uuid) -> CoreResult<Option<Departure>> {
        let row = sqlx::query_as::<_, DepartureRow>(&format!(
            "SELECT {} FROM departures WHERE id = $1",
            DEPARTURE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Departure::try_from).transpose()
    }

    /// Why a guarded reservation did not apply.
    async fn explain_rejection(&mut self, id: Uuid) -> CoreResult<SeatReservation> {
        Ok(match self.select_departure(id).await? {
            None => SeatReservation::Missing,
            Some(departure) if !departure.status.is_reservable() => {
                SeatReservation::NotReservable(departure.status)
            }
            Some(departure) => SeatReservation::Insufficient {
                free_seats: departure.free_seats(),
            },
        })
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn find_departure(&mut self, id: Uuid) -> CoreResult<Option<Departure>> {
        self.select_departure(id).await
    }

    async fn try_reserve_seats(&mut self, id: Uuid, seats: u32) -> CoreResult<SeatReservation> {
        // Capacity is INT4, so a request beyond i32 can never fit.
        let Ok(seats) = i32::try_from(seats) else {
            return self.explain_rejection(id).await;
        };
        let reservable: Vec<String> = DepartureStatus::RESERVABLE
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // Check and increment in one statement; concurrent writers serialize on the row.
        let row = sqlx::query_as::<_, DepartureRow>(&format!(
            r#"
            UPDATE departures
            SET reserved_seats = reserved_seats + $2,
                status = CASE WHEN reserved_seats::bigint + $2 = capacity THEN 'full' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
              AND status = ANY($3)
              AND reserved_seats::bigint + $2 <= capacity
            RETURNING {}
            "#,
            DEPARTURE_COLUMNS
        ))
        .bind(id)
        .bind(seats)
        .bind(&reservable)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = row {
            return Ok(SeatReservation::Reserved(Departure::try_from(row)?));
        }
        self.explain_rejection(id).await
    }

    async fn release_seats(&mut self, id: Uuid, seats: u32) -> CoreResult<Option<Departure>> {
        let row = sqlx::query_as::<_, DepartureRow>(&format!(
            r#"
            UPDATE departures
            SET reserved_seats = GREATEST(reserved_seats - $2, 0),
                status = CASE
                    WHEN status = 'full' AND GREATEST(reserved_seats - $2, 0) < capacity THEN 'has_space'
                    ELSE status
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            DEPARTURE_COLUMNS
        ))
        .bind(id)
        .bind(to_i32(seats)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Departure::try_from).transpose()
    }

    async fn insert_booking(&mut self, booking: &Booking) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (id, user_id, departure_id, adults, children, total_amount, payment_method, status, refund_amount, cancelled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(booking.id)
        .bind(booking.user_id)
        .bind(booking.departure_id)
        .bind(to_i32(booking.adults)?)
        .bind(to_i32(booking.children)?)
        .bind(booking.total_amount)
        .bind(&booking.payment_method)
        .bind(booking.status.as_str())
        .bind(booking.refund_amount)
        .bind(booking.cancelled_at)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_booking(&mut self, id: Uuid) -> CoreResult<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            "SELECT {} FROM bookings WHERE id = $1 FOR UPDATE",
            BOOKING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn update_booking_status(
        &mut self,
        id: Uuid,
        from: &[BookingStatus],
        to: BookingStatus,
        refund_amount: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<Booking>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query_as::<_, BookingRow>(&format!(
            r#"
            UPDATE bookings
            SET status = $3,
                updated_at = $4,
                refund_amount = CASE WHEN $3 = 'cancelled' THEN $5 ELSE refund_amount END,
                cancelled_at = CASE WHEN $3 = 'cancelled' THEN $4 ELSE cancelled_at END
            WHERE id = $1 AND status = ANY($2)
            RETURNING {}
            "#,
            BOOKING_COLUMNS
        ))
        .bind(id)
        .bind(&from)
        .bind(to.as_str())
        .bind(at)
        .bind(refund_amount)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Booking::try_from).transpose()
    }

    async fn list_passengers(&mut self, booking_id: Uuid) -> CoreResult<Vec<Passenger>> {
        let rows = sqlx::query_as::<_, PassengerRow>(
            r#"
            SELECT id, booking_id, full_name, passenger_type, date_of_birth, identity_number, created_at
            FROM passengers
            WHERE booking_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(booking_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(Passenger::try_from).collect()
    }

    async fn insert_passengers(&mut self, passengers: &[Passenger]) -> CoreResult<()> {
        for passenger in passengers {
            sqlx::query(
                r#"
                INSERT INTO passengers (id, booking_id, full_name, passenger_type, date_of_birth, identity_number, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(passenger.id)
            .bind(passenger.booking_id)
            .bind(&passenger.full_name)
            .bind(passenger.passenger_type.as_str())
            .bind(passenger.date_of_birth)
            .bind(&passenger.identity_number)
            .bind(passenger.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (id, booking_id, user_id, internal_code, gateway_id, amount, status, gateway_reference, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.booking_id)
        .bind(transaction.user_id)
        .bind(&transaction.internal_code)
        .bind(&transaction.gateway_id)
        .bind(transaction.amount)
        .bind(transaction.status.as_str())
        .bind(&transaction.gateway_reference)
        .bind(transaction.created_at)
        .bind(transaction.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_transaction_by_code(&mut self, code: &str) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE internal_code = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Transaction::try_from).transpose()
    }

    async fn lock_transaction(&mut self, id: Uuid) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Transaction::try_from).transpose()
    }

    async fn find_awaiting_transaction(
        &mut self,
        booking_id: Uuid,
        since: DateTime<Utc>,
    ) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE booking_id = $1 AND status = 'awaiting_payment' AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(booking_id)
        .bind(since)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Transaction::try_from).transpose()
    }

    async fn update_transaction_status(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        gateway_reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> CoreResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            UPDATE transactions
            SET status = $2,
                gateway_reference = COALESCE($3, gateway_reference),
                updated_at = $4
            WHERE id = $1 AND status <> 'succeeded' AND status <> $2
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(gateway_reference)
        .bind(at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        row.map(Transaction::try_from).transpose()
    }

    async fn enqueue_event(&mut self, envelope: &EventEnvelope) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, event_type, booking_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(envelope.id)
        .bind(&envelope.event_type)
        .bind(envelope.booking_id)
        .bind(&envelope.payload)
        .bind(envelope.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> CoreResult<()> {
        self.tx.commit().await.map_err(db_err)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn pending_events(&self, limit: usize) -> CoreResult<Vec<EventEnvelope>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, event_type, booking_id, payload, created_at
            FROM outbox_events
            WHERE dispatched_at IS NULL
            ORDER BY created_at, id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| EventEnvelope {
                id: row.id,
                event_type: row.event_type,
                booking_id: row.booking_id,
                payload: row.payload,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn mark_dispatched(&self, ids: &[Uuid], at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query("UPDATE outbox_events SET dispatched_at = $2 WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl PricingCatalog for PgStore {
    async fn quote(&self, departure: &Departure) -> CoreResult<PriceQuote> {
        let row = sqlx::query_as::<_, PriceRow>(
            "SELECT adult_price, child_price FROM departure_prices WHERE departure_id = $1",
        )
        .bind(departure.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| CoreError::not_found("price", departure.id))?;

        Ok(PriceQuote {
            adult_price: row.adult_price,
            child_price: row.child_price,
        })
    }
}
