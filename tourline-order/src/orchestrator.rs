use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tourline_core::access::{Capability, Principal};
use tourline_core::clock::Clock;
use tourline_core::ledger::TransactionLedger;
use tourline_core::models::{BookingStatus, TransactionStatus};
use tourline_core::payment::{
    build_payment_url, GatewayAck, GatewayCallback, GatewaySettings, GatewaySigner,
    PaymentRequestParams,
};
use tourline_core::repository::Store;
use tourline_core::{CoreError, CoreResult};
use tourline_shared::models::events::BookingPaidEvent;
use tourline_shared::BookingEvent;
use tracing::{info, warn};
use uuid::Uuid;

use crate::manager::{enqueue, BookingManager};

/// A signed redirect the customer follows to pay.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub payment_url: String,
    pub internal_code: String,
    pub amount: Decimal,
    pub expires_at: DateTime<Utc>,
    /// Whether an existing, unexpired attempt was handed out again.
    pub reused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Paid,
    PaymentFailed,
}

/// What the customer's browser is told after the gateway redirects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    Paid,
    PaymentFailed,
    AlreadyProcessed,
    Invalid,
}

impl ReturnStatus {
    pub fn from_result(result: &CoreResult<ReconcileOutcome>) -> Self {
        match result {
            Ok(ReconcileOutcome::Paid) => ReturnStatus::Paid,
            Ok(ReconcileOutcome::PaymentFailed) => ReturnStatus::PaymentFailed,
            Err(CoreError::AlreadyProcessed(_)) => ReturnStatus::AlreadyProcessed,
            Err(_) => ReturnStatus::Invalid,
        }
    }
}

/// Translate a reconciliation result into the gateway's ack vocabulary.
pub fn gateway_ack(result: &CoreResult<ReconcileOutcome>) -> GatewayAck {
    match result {
        // A recorded failure is still a successfully processed notification.
        Ok(_) => GatewayAck::confirmed(),
        Err(CoreError::InvalidSignature) => GatewayAck::invalid_signature(),
        // A malformed callback cannot be matched to an order; retrying it never helps.
        Err(CoreError::NotFound { .. }) | Err(CoreError::InvalidArgument(_)) => {
            GatewayAck::order_not_found()
        }
        Err(CoreError::AlreadyProcessed(_)) | Err(CoreError::InvalidState(_)) => {
            GatewayAck::already_confirmed()
        }
        Err(CoreError::AmountMismatch { .. }) => GatewayAck::invalid_amount(),
        Err(_) => GatewayAck::unknown_error(),
    }
}

/// Outbound payment requests and inbound gateway reconciliation. The gateway
/// is untrusted: nothing is applied before its signature verifies.
pub struct PaymentOrchestrator {
    store: Arc<dyn Store>,
    settings: GatewaySettings,
    signer: GatewaySigner,
    payment_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        settings: GatewaySettings,
        payment_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let signer = GatewaySigner::new(settings.hash_secret.clone());
        Self {
            store,
            settings,
            signer,
            payment_ttl,
            clock,
        }
    }

    pub async fn create_payment_request(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        return_url: &str,
        client_ip: &str,
    ) -> CoreResult<PaymentRequest> {
        if return_url.trim().is_empty() {
            return Err(CoreError::InvalidArgument("return_url is required".to_string()));
        }

        let mut tx = self.store.begin().await?;
        let booking = tx
            .find_booking(booking_id)
            .await?
            .ok_or_else(|| CoreError::not_found("booking", booking_id))?;
        principal.require_owner(Capability::BookTours, booking.user_id)?;

        if !booking.status.is_payable() {
            return Err(CoreError::InvalidState(format!(
                "booking {} is {}",
                booking_id, booking.status
            )));
        }

        let now = self.clock.now();
        let (transaction, reused) =
            match TransactionLedger::find_pending_for_booking(tx.as_mut(), booking_id, now, self.payment_ttl).await? {
                Some(existing) => (existing, true),
                None => {
                    let created = TransactionLedger::create(
                        tx.as_mut(),
                        booking_id,
                        booking.user_id,
                        &self.settings.gateway_id,
                        booking.total_amount,
                        now,
                    )
                    .await?;
                    (created, false)
                }
            };

        let expires_at = now + self.payment_ttl;
        let payment_url = build_payment_url(
            &self.settings,
            &self.signer,
            &PaymentRequestParams {
                internal_code: &transaction.internal_code,
                amount: transaction.amount,
                order_info: format!("Payment for booking {}", booking_id),
                return_url,
                client_ip,
                created_at: now,
                expires_at,
            },
        )?;
        tx.commit().await?;

        info!(
            "Payment request for booking {}: transaction {} ({})",
            booking_id,
            transaction.internal_code,
            if reused { "reused" } else { "new" }
        );
        Ok(PaymentRequest {
            payment_url,
            internal_code: transaction.internal_code,
            amount: transaction.amount,
            expires_at,
            reused,
        })
    }

    pub fn verify_callback(&self, params: &HashMap<String, String>) -> bool {
        self.signer.verify(params)
    }

    /// Apply a gateway notification at most once. Signature, idempotency,
    /// amount and booking state are all checked before anything is written,
    /// and the transaction and booking change together or not at all.
    pub async fn reconcile(&self, params: &HashMap<String, String>) -> CoreResult<ReconcileOutcome> {
        if !self.verify_callback(params) {
            warn!(
                "Rejected gateway callback with invalid signature (txn ref {:?})",
                params.get("vnp_TxnRef")
            );
            return Err(CoreError::InvalidSignature);
        }
        let callback = GatewayCallback::from_params(params).map_err(|e| {
            warn!(
                "Signed gateway callback is malformed (txn ref {:?}): {}",
                params.get("vnp_TxnRef"),
                e
            );
            e
        })?;

        let mut tx = self.store.begin().await?;
        // Booking row before transaction row, the same order as payment requests.
        let located = TransactionLedger::find_by_code(tx.as_mut(), &callback.internal_code).await?;
        let booking = match located.booking_id {
            Some(booking_id) => Some(
                tx.find_booking(booking_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("booking", booking_id))?,
            ),
            None => None,
        };
        let transaction = TransactionLedger::lock(tx.as_mut(), &located).await?;

        let success = callback.is_success();
        if transaction.status == TransactionStatus::Succeeded
            || (!success && transaction.status == TransactionStatus::Failed)
        {
            info!(
                "Gateway callback for transaction {} already applied ({})",
                transaction.internal_code, transaction.status
            );
            return Err(CoreError::AlreadyProcessed(format!(
                "transaction {} is {}",
                transaction.internal_code, transaction.status
            )));
        }

        if callback.amount != transaction.amount {
            warn!(
                "Amount mismatch on transaction {}: recorded {}, gateway notified {}",
                transaction.internal_code, transaction.amount, callback.amount
            );
            return Err(CoreError::AmountMismatch {
                expected: transaction.amount,
                notified: callback.amount,
            });
        }

        let booking = booking.ok_or_else(|| {
            CoreError::InvalidState(format!(
                "transaction {} is not linked to a booking",
                transaction.internal_code
            ))
        })?;
        let booking_id = booking.id;
        if !booking.status.is_payable() {
            warn!(
                "Gateway callback for transaction {} but booking {} is {}",
                transaction.internal_code, booking_id, booking.status
            );
            return Err(CoreError::InvalidState(format!(
                "booking {} is {}",
                booking_id, booking.status
            )));
        }

        let now = self.clock.now();
        if !success {
            TransactionLedger::update_status(tx.as_mut(), &transaction, TransactionStatus::Failed, None, now)
                .await?;
            tx.commit().await?;
            info!(
                "Payment failed for booking {} (transaction {}, code {})",
                booking_id, transaction.internal_code, callback.response_code
            );
            return Ok(ReconcileOutcome::PaymentFailed);
        }

        let paid_transaction = TransactionLedger::update_status(
            tx.as_mut(),
            &transaction,
            TransactionStatus::Succeeded,
            callback.gateway_reference.as_deref(),
            now,
        )
        .await?;
        BookingManager::transition(tx.as_mut(), &booking, BookingStatus::Paid, now).await?;
        enqueue(
            tx.as_mut(),
            BookingEvent::Paid(BookingPaidEvent {
                booking_id,
                user_id: booking.user_id,
                transaction_code: paid_transaction.internal_code.clone(),
                gateway_reference: paid_transaction.gateway_reference.clone(),
                amount: paid_transaction.amount,
                timestamp: now.timestamp(),
            }),
            now,
        )
        .await?;
        tx.commit().await?;

        info!(
            "Booking {} paid via transaction {} (gateway ref {:?})",
            booking_id, paid_transaction.internal_code, paid_transaction.gateway_reference
        );
        Ok(ReconcileOutcome::Paid)
    }
}
