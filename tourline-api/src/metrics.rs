use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tourline_core::CoreError;
use tourline_order::ReconcileOutcome;

use crate::state::AppState;

/// Booking and payment counters, registered in a dedicated registry.
#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    pub bookings_created_total: IntCounter,
    pub bookings_rejected_capacity_total: IntCounter,
    pub bookings_cancelled_total: IntCounter,
    /// Labelled by `outcome`.
    pub reconciliations_total: IntCounterVec,
    pub outbox_events_dispatched_total: IntCounter,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tourline".into()), None)?;

        let bookings_created_total =
            IntCounter::new("bookings_created_total", "Bookings created")?;
        registry.register(Box::new(bookings_created_total.clone()))?;

        let bookings_rejected_capacity_total = IntCounter::new(
            "bookings_rejected_capacity_total",
            "Booking attempts rejected for insufficient capacity",
        )?;
        registry.register(Box::new(bookings_rejected_capacity_total.clone()))?;

        let bookings_cancelled_total =
            IntCounter::new("bookings_cancelled_total", "Bookings cancelled")?;
        registry.register(Box::new(bookings_cancelled_total.clone()))?;

        let reconciliations_total = IntCounterVec::new(
            Opts::new("reconciliations_total", "Gateway callbacks processed, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let outbox_events_dispatched_total = IntCounter::new(
            "outbox_events_dispatched_total",
            "Outbox events published to the event bus",
        )?;
        registry.register(Box::new(outbox_events_dispatched_total.clone()))?;

        Ok(Self {
            registry,
            bookings_created_total,
            bookings_rejected_capacity_total,
            bookings_cancelled_total,
            reconciliations_total,
            outbox_events_dispatched_total,
        })
    }

    pub fn record_reconciliation(&self, result: &Result<ReconcileOutcome, CoreError>) {
        let outcome = match result {
            Ok(ReconcileOutcome::Paid) => "paid",
            Ok(ReconcileOutcome::PaymentFailed) => "payment_failed",
            Err(CoreError::AlreadyProcessed(_)) => "already_processed",
            Err(CoreError::InvalidSignature) => "invalid_signature",
            Err(CoreError::AmountMismatch { .. }) => "amount_mismatch",
            Err(CoreError::NotFound { .. }) => "not_found",
            Err(CoreError::InvalidState(_)) => "invalid_state",
            Err(_) => "error",
        };
        self.reconciliations_total.with_label_values(&[outcome]).inc();
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
