use serde::Deserialize;
use std::env;
use tourline_core::payment::GatewaySettings;
use tourline_core::refund::{default_tiers, RefundTier};
use tourline_shared::Masked;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    /// Without Kafka the dispatcher only logs outbox events.
    pub kafka: Option<KafkaConfig>,
    pub auth: AuthConfig,
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub booking: BookingRules,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BookingRules {
    #[serde(default = "default_payment_ttl")]
    pub payment_ttl_seconds: u64,
    #[serde(default = "default_tiers")]
    pub refund_tiers: Vec<RefundTier>,
}

fn default_payment_ttl() -> u64 { 15 * 60 }

impl Default for BookingRules {
    fn default() -> Self {
        Self {
            payment_ttl_seconds: default_payment_ttl(),
            refund_tiers: default_tiers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl DispatcherConfig {
    /// A zero batch would make the dispatcher poll in a tight loop.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.batch_size == 0 {
            return Err(config::ConfigError::Message(
                "dispatcher.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Masked<String>,
    pub jwt_expiration_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection string, or `memory` for the in-process store.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 10 }

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == "memory"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
}

fn default_topic() -> String { "tourline.booking-events".to_string() }

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TOURLINE__GATEWAY__HASH_SECRET=...`
            .add_source(config::Environment::with_prefix("TOURLINE").separator("__"))
            .build()?;

        let config: Self = s.try_deserialize()?;
        config.dispatcher.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_batch_must_be_positive() {
        assert!(DispatcherConfig::default().validate().is_ok());

        let zero = DispatcherConfig {
            poll_interval_ms: 500,
            batch_size: 0,
        };
        let err = zero.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }
}
