use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

// ============================================================================
// Departure
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DepartureStatus {
    Scheduled,
    Confirmed,
    HasSpace,
    Full,
    Cancelled,
    Completed,
}

impl DepartureStatus {
    pub const RESERVABLE: [DepartureStatus; 3] = [
        DepartureStatus::Scheduled,
        DepartureStatus::Confirmed,
        DepartureStatus::HasSpace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DepartureStatus::Scheduled => "scheduled",
            DepartureStatus::Confirmed => "confirmed",
            DepartureStatus::HasSpace => "has_space",
            DepartureStatus::Full => "full",
            DepartureStatus::Cancelled => "cancelled",
            DepartureStatus::Completed => "completed",
        }
    }

    /// Seats may only be taken on departures in one of these states.
    pub fn is_reservable(&self) -> bool {
        Self::RESERVABLE.contains(self)
    }
}

impl fmt::Display for DepartureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepartureStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(DepartureStatus::Scheduled),
            "confirmed" => Ok(DepartureStatus::Confirmed),
            "has_space" => Ok(DepartureStatus::HasSpace),
            "full" => Ok(DepartureStatus::Full),
            "cancelled" => Ok(DepartureStatus::Cancelled),
            "completed" => Ok(DepartureStatus::Completed),
            other => Err(CoreError::InternalError(format!("unknown departure status '{}'", other))),
        }
    }
}

/// A dated occurrence of a tour that customers book seats against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Departure {
    pub id: Uuid,
    pub tour_id: Uuid,
    pub departs_on: NaiveDate,
    pub returns_on: NaiveDate,
    pub capacity: u32,
    pub reserved_seats: u32,
    pub status: DepartureStatus,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Departure {
    pub fn free_seats(&self) -> u32 {
        self.capacity.saturating_sub(self.reserved_seats)
    }
}

/// Answer to "can N more seats be reserved on this departure right now?"
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub free_seats: u32,
}

/// Per-seat price supplied by the pricing collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceQuote {
    pub adult_price: Decimal,
    pub child_price: Decimal,
}

impl PriceQuote {
    pub fn total(&self, adults: u32, children: u32) -> Decimal {
        self.adult_price * Decimal::from(adults) + self.child_price * Decimal::from(children)
    }
}

// ============================================================================
// Booking
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingConfirmation,
    Confirmed,
    Paid,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// States that still hold seats and may be cancelled.
    pub const CANCELLABLE: [BookingStatus; 3] = [
        BookingStatus::PendingConfirmation,
        BookingStatus::Confirmed,
        BookingStatus::Paid,
    ];

    /// States in which a payment is still acceptable.
    pub const PAYABLE: [BookingStatus; 2] = [
        BookingStatus::PendingConfirmation,
        BookingStatus::Confirmed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingConfirmation => "pending_confirmation",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Paid => "paid",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn is_payable(&self) -> bool {
        Self::PAYABLE.contains(self)
    }

    /// Allowed edges of the booking state machine. Payment may skip the
    /// supplier confirmation step.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (PendingConfirmation, Confirmed)
                | (PendingConfirmation, Paid)
                | (Confirmed, Paid)
                | (Paid, Completed)
                | (PendingConfirmation, Cancelled)
                | (Confirmed, Cancelled)
                | (Paid, Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_confirmation" => Ok(BookingStatus::PendingConfirmation),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "paid" => Ok(BookingStatus::Paid),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(CoreError::InternalError(format!("unknown booking status '{}'", other))),
        }
    }
}

/// A customer's reservation of seats on one departure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub departure_id: Uuid,
    pub adults: u32,
    pub children: u32,
    pub total_amount: Decimal,
    pub payment_method: String,
    pub status: BookingStatus,
    pub refund_amount: Option<Decimal>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn seats(&self) -> u32 {
        self.adults + self.children
    }
}

/// Input for booking creation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub departure_id: Uuid,
    pub adults: u32,
    #[serde(default)]
    pub children: u32,
    pub payment_method: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassengerType {
    Adult,
    Child,
}

impl PassengerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassengerType::Adult => "adult",
            PassengerType::Child => "child",
        }
    }
}

impl FromStr for PassengerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adult" => Ok(PassengerType::Adult),
            "child" => Ok(PassengerType::Child),
            other => Err(CoreError::InternalError(format!("unknown passenger type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passenger {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub full_name: String,
    pub passenger_type: PassengerType,
    pub date_of_birth: Option<NaiveDate>,
    pub identity_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPassenger {
    pub full_name: String,
    pub passenger_type: PassengerType,
    pub date_of_birth: Option<NaiveDate>,
    pub identity_number: Option<String>,
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    AwaitingPayment,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::AwaitingPayment => "awaiting_payment",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_payment" => Ok(TransactionStatus::AwaitingPayment),
            "succeeded" => Ok(TransactionStatus::Succeeded),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(CoreError::InternalError(format!("unknown transaction status '{}'", other))),
        }
    }
}

/// One payment attempt against a booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub booking_id: Option<Uuid>,
    pub user_id: Uuid,
    pub internal_code: String,
    pub gateway_id: String,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// An attempt may be handed out again only while awaiting payment and inside the TTL.
    pub fn is_reusable(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.status == TransactionStatus::AwaitingPayment && now < self.created_at + ttl
    }
}
