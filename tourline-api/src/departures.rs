use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tourline_core::models::Availability;
use uuid::Uuid;

use crate::{error::AppError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    #[serde(default = "one_seat")]
    pub seats: u32,
}

fn one_seat() -> u32 { 1 }

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/departures/{id}/availability", get(check_availability))
}

/// GET /v1/departures/{id}/availability?seats=N
async fn check_availability(
    State(state): State<AppState>,
    Path(departure_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Availability>, AppError> {
    let availability = state.bookings.check_availability(departure_id, query.seats).await?;
    Ok(Json(availability))
}
