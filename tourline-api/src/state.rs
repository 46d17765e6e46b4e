use std::sync::Arc;
use tourline_order::{BookingManager, PaymentOrchestrator};
use tourline_shared::Masked;
use tourline_store::RedisClient;

use crate::metrics::ApiMetrics;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: Masked<String>,
    pub expiration: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<BookingManager>,
    pub payments: Arc<PaymentOrchestrator>,
    /// Rate limiting is skipped when Redis is not configured.
    pub redis: Option<Arc<RedisClient>>,
    pub metrics: Arc<ApiMetrics>,
    pub auth: AuthConfig,
}
