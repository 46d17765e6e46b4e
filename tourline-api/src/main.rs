use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tourline_api::{
    app,
    metrics::ApiMetrics,
    state::{AppState, AuthConfig},
    worker::{LogPublisher, OutboxDispatcher},
};
use tourline_core::clock::{Clock, SystemClock};
use tourline_core::refund::RefundPolicy;
use tourline_core::repository::{EventPublisher, OutboxStore, PricingCatalog, Store};
use tourline_order::{BookingManager, PaymentOrchestrator};
use tourline_store::{app_config::Config, DbClient, EventProducer, MemoryStore, PgStore, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tourline_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!("Starting Tourline API on port {}", config.server.port);

    // Store
    let (store, outbox, pricing): (Arc<dyn Store>, Arc<dyn OutboxStore>, Arc<dyn PricingCatalog>) =
        if config.database.is_memory() {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            let memory = MemoryStore::new();
            (Arc::new(memory.clone()), Arc::new(memory.clone()), Arc::new(memory))
        } else {
            let db = DbClient::new(&config.database).await?;
            db.migrate().await?;
            let pg = PgStore::new(db.pool.clone());
            (Arc::new(pg.clone()), Arc::new(pg.clone()), Arc::new(pg))
        };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let refund_policy = RefundPolicy::new(config.booking.refund_tiers.clone())?;
    let payment_ttl = chrono::Duration::seconds(config.booking.payment_ttl_seconds as i64);

    let bookings = BookingManager::new(store.clone(), pricing, refund_policy, clock.clone());
    let payments = PaymentOrchestrator::new(store, config.gateway.clone(), payment_ttl, clock);

    // Redis Connection
    let redis = match &config.redis {
        Some(redis_config) => match RedisClient::new(&redis_config.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting disabled: {}", e);
                None
            }
        },
        None => None,
    };

    // Kafka Connection
    let publisher: Arc<dyn EventPublisher> = match &config.kafka {
        Some(kafka_config) => Arc::new(EventProducer::new(kafka_config)?),
        None => {
            tracing::warn!("Kafka not configured; outbox events are only logged");
            Arc::new(LogPublisher)
        }
    };

    let metrics = Arc::new(ApiMetrics::new()?);

    let dispatcher = OutboxDispatcher::new(
        outbox,
        publisher,
        metrics.clone(),
        config.dispatcher.batch_size,
        Duration::from_millis(config.dispatcher.poll_interval_ms),
    );
    tokio::spawn(dispatcher.run());

    let app_state = AppState {
        bookings: Arc::new(bookings),
        payments: Arc::new(payments),
        redis,
        metrics,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
