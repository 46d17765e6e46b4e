use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use tourline_core::payment::GatewayAck;
use tourline_order::{gateway_ack, ReturnStatus};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ReturnResponse {
    pub status: ReturnStatus,
    pub transaction_code: Option<String>,
}

/// Gateway-facing routes. Unauthenticated: trust comes from the signature.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments/gateway/return", get(gateway_return))
        .route("/v1/payments/gateway/ipn", get(gateway_ipn))
}

/// GET /v1/payments/gateway/return
/// Browser redirect after payment. Only a generic outcome is shown.
async fn gateway_return(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<ReturnResponse> {
    let result = state.payments.reconcile(&params).await;
    state.metrics.record_reconciliation(&result);

    if let Err(e) = &result {
        tracing::debug!("Gateway return not applied: {}", e);
    }

    Json(ReturnResponse {
        status: ReturnStatus::from_result(&result),
        transaction_code: params.get("vnp_TxnRef").cloned(),
    })
}

/// GET /v1/payments/gateway/ipn
/// Server-to-server notification. Always 200; the body carries the ack code.
async fn gateway_ipn(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<GatewayAck> {
    let result = state.payments.reconcile(&params).await;
    state.metrics.record_reconciliation(&result);

    let ack = gateway_ack(&result);
    tracing::info!(
        "IPN for {:?} acknowledged with {} ({})",
        params.get("vnp_TxnRef"),
        ack.rsp_code,
        ack.message
    );
    Json(ack)
}
