use axum::{
    extract::State,
    Json,
    routing::post,
    Router,
};
use serde::Serialize;
use tourline_core::access::Role;
use uuid::Uuid;
use crate::{state::AppState, error::AppError, middleware::auth::issue_token};

#[derive(Debug, Serialize)]
struct AuthResponse {
    token: String,
    user_id: Uuid,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/auth/guest", post(login_guest))
}

/// A fresh guest identity that may book and pay for its own bookings.
async fn login_guest(State(state): State<AppState>) -> Result<Json<AuthResponse>, AppError> {
    let user_id = Uuid::new_v4();
    let token = issue_token(&state.auth, user_id, Role::Guest)
        .map_err(|e| AppError::InternalServerError(format!("Token encoding failed: {}", e)))?;

    Ok(Json(AuthResponse { token, user_id }))
}
