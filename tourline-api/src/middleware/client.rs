use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use std::net::SocketAddr;

use crate::state::AppState;

const RATE_LIMIT: i64 = 100;
const RATE_WINDOW_SECONDS: i64 = 60;

/// Caller address as seen by the service: first `X-Forwarded-For` hop, else
/// the socket peer.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

pub async fn client_ip_middleware(mut req: Request, next: Next) -> Response {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let ip = forwarded
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "127.0.0.1".to_string());

    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    req: Request,
    next: Next,
) -> Response {
    let Some(redis) = state.redis.as_ref() else {
        return next.run(req).await;
    };

    let key = format!("ratelimit:{}", ip);
    match redis.check_rate_limit(&key, RATE_LIMIT, RATE_WINDOW_SECONDS).await {
        Ok(true) => next.run(req).await,
        Ok(false) => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response(),
        Err(e) => {
            tracing::warn!("Rate limiter unavailable, failing open: {}", e);
            next.run(req).await
        }
    }
}
