use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Transaction, TransactionStatus};
use crate::repository::StoreTx;
use crate::{CoreError, CoreResult};

/// Record of payment attempts per booking, keyed by internal code. The only
/// writer of a transaction's status.
pub struct TransactionLedger;

impl TransactionLedger {
    /// Globally unique, human-traceable attempt code: booking id plus a
    /// nanosecond timestamp.
    pub fn mint_code(booking_id: Uuid, at: DateTime<Utc>) -> String {
        let nanos = at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| at.timestamp_micros() * 1_000);
        format!("{}-{}", booking_id.simple(), nanos)
    }

    pub async fn create(
        tx: &mut dyn StoreTx,
        booking_id: Uuid,
        user_id: Uuid,
        gateway_id: &str,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> CoreResult<Transaction> {
        let transaction = Transaction {
            id: Uuid::new_v4(),
            booking_id: Some(booking_id),
            user_id,
            internal_code: Self::mint_code(booking_id, at),
            gateway_id: gateway_id.to_string(),
            amount,
            status: TransactionStatus::AwaitingPayment,
            gateway_reference: None,
            created_at: at,
            updated_at: at,
        };
        tx.insert_transaction(&transaction).await?;
        Ok(transaction)
    }

    pub async fn find_by_code(tx: &mut dyn StoreTx, code: &str) -> CoreResult<Transaction> {
        tx.find_transaction_by_code(code)
            .await?
            .ok_or_else(|| CoreError::not_found("transaction", code))
    }

    /// Fresh, locked copy of `transaction`.
    pub async fn lock(tx: &mut dyn StoreTx, transaction: &Transaction) -> CoreResult<Transaction> {
        tx.lock_transaction(transaction.id)
            .await?
            .ok_or_else(|| CoreError::not_found("transaction", &transaction.internal_code))
    }

    /// The attempt still eligible for reuse, if any. Entries older than the
    /// TTL are never returned.
    pub async fn find_pending_for_booking(
        tx: &mut dyn StoreTx,
        booking_id: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> CoreResult<Option<Transaction>> {
        let since = now - ttl;
        let found = tx.find_awaiting_transaction(booking_id, since).await?;
        Ok(found.filter(|t| t.is_reusable(now, ttl)))
    }

    /// Apply a terminal status. A transaction that already succeeded, or
    /// already holds `status`, is never written again.
    pub async fn update_status(
        tx: &mut dyn StoreTx,
        transaction: &Transaction,
        status: TransactionStatus,
        gateway_reference: Option<&str>,
        at: DateTime<Utc>,
    ) -> CoreResult<Transaction> {
        tx.update_transaction_status(transaction.id, status, gateway_reference, at)
            .await?
            .ok_or_else(|| {
                CoreError::AlreadyProcessed(format!(
                    "transaction {} already {}",
                    transaction.internal_code, transaction.status
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_codes_are_distinct_per_instant() {
        let booking = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap();
        let a = TransactionLedger::mint_code(booking, t0);
        let b = TransactionLedger::mint_code(booking, t0 + Duration::nanoseconds(1));

        assert_ne!(a, b);
        assert!(a.starts_with(&booking.simple().to_string()));
    }
}
