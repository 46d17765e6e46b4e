use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use tourline_core::access::Principal;
use tourline_core::models::{Booking, NewBooking, NewPassenger, Passenger};
use tourline_core::refund::RefundBreakdown;
use tourline_core::CoreError;
use tourline_order::{BookingDetails, PaymentRequest};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::ClientIp;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddPassengersRequest {
    pub passengers: Vec<NewPassenger>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub return_url: String,
}

/// Routes here sit behind the auth middleware.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/bookings", post(create_booking))
        .route("/v1/bookings/{id}", get(get_booking))
        .route("/v1/bookings/{id}/passengers", post(add_passengers))
        .route("/v1/bookings/{id}/refund-preview", get(refund_preview))
        .route("/v1/bookings/{id}/cancel", post(cancel_booking))
        .route("/v1/bookings/{id}/confirm", post(confirm_booking))
        .route("/v1/bookings/{id}/complete", post(complete_booking))
        .route("/v1/bookings/{id}/payments", post(create_payment))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/bookings
async fn create_booking(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<NewBooking>,
) -> Result<(StatusCode, Json<Booking>), AppError> {
    match state.bookings.create_booking(&principal, req).await {
        Ok(booking) => {
            state.metrics.bookings_created_total.inc();
            Ok((StatusCode::CREATED, Json(booking)))
        }
        Err(e) => {
            if matches!(e, CoreError::InsufficientCapacity { .. }) {
                state.metrics.bookings_rejected_capacity_total.inc();
            }
            Err(e.into())
        }
    }
}

/// GET /v1/bookings/{id}
async fn get_booking(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<BookingDetails>, AppError> {
    Ok(Json(state.bookings.get_booking(&principal, booking_id).await?))
}

/// POST /v1/bookings/{id}/passengers
async fn add_passengers(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<AddPassengersRequest>,
) -> Result<(StatusCode, Json<Vec<Passenger>>), AppError> {
    let passengers = state
        .bookings
        .add_passengers(&principal, booking_id, req.passengers)
        .await?;
    Ok((StatusCode::CREATED, Json(passengers)))
}

/// GET /v1/bookings/{id}/refund-preview
async fn refund_preview(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<RefundBreakdown>, AppError> {
    Ok(Json(state.bookings.refund_preview(&principal, booking_id).await?))
}

/// POST /v1/bookings/{id}/cancel
async fn cancel_booking(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<RefundBreakdown>, AppError> {
    let breakdown = state.bookings.cancel_booking(&principal, booking_id).await?;
    state.metrics.bookings_cancelled_total.inc();
    Ok(Json(breakdown))
}

/// POST /v1/bookings/{id}/confirm
async fn confirm_booking(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.confirm_booking(&principal, booking_id).await?))
}

/// POST /v1/bookings/{id}/complete
async fn complete_booking(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    Ok(Json(state.bookings.complete_booking(&principal, booking_id).await?))
}

/// POST /v1/bookings/{id}/payments
/// Returns the signed gateway URL the customer is redirected to.
async fn create_payment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    Path(booking_id): Path<Uuid>,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<Json<PaymentRequest>, AppError> {
    let request = state
        .payments
        .create_payment_request(&principal, booking_id, &req.return_url, &client_ip)
        .await?;
    Ok(Json(request))
}
