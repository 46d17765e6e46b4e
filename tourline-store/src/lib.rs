pub mod app_config;
pub mod database;
pub mod events;
pub mod memory;
pub mod postgres;
pub mod redis_repo;

pub use database::DbClient;
pub use events::EventProducer;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use redis_repo::RedisClient;
