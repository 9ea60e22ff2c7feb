use std::env;

use dotenv::dotenv;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::rabbitmq::errors::Result;

/// Loads `.env` (if present) and applies environment overrides on top of
/// `config`.
pub fn apply_env_overrides(config: &mut BrokerConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |key| env::var(key).ok())
}

/// Applies overrides from an arbitrary lookup, so tests never touch the
/// process environment.
pub fn apply_overrides_from<F>(config: &mut BrokerConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("AMQP_ADDR") {
        config.connection.uri = val;
    }
    if let Some(val) = lookup("CHAT_EXCHANGE") {
        config.topology.exchange = val;
    }
    if let Some(val) = lookup("CHAT_QUEUE") {
        config.topology.queue = val;
    }
    if let Some(val) = lookup("CHAT_ROUTING_KEY") {
        config.topology.routing_key = val;
    }
    if let Some(val) = lookup("BATCH_MAX_WAIT_MS") {
        config.batching.max_wait_ms = val.parse()?;
    }
    if let Some(val) = lookup("BATCH_MAX_SIZE") {
        config.batching.max_batch_size = val.parse()?;
    }
    if let Some(val) = lookup("BATCH_WINDOW_MS") {
        config.batching.window_ms = val.parse()?;
    }
    if let Some(val) = lookup("RETRY_MAX_ATTEMPTS") {
        config.retry.max_attempts = val.parse()?;
    }
    if let Some(val) = lookup("RETRY_INTERVAL_MS") {
        config.retry.retry_interval_ms = val.parse()?;
    }
    if let Some(val) = lookup("RETRY_MAX_QUEUE_SIZE") {
        config.retry.max_queue_size = val.parse()?;
    }
    if let Some(val) = lookup("RECONNECT_MAX_ATTEMPTS") {
        // "0" or "infinite" means retry forever
        config.reconnect.max_attempts = match val.as_str() {
            "0" | "infinite" => None,
            other => Some(other.parse()?),
        };
    }
    if let Some(val) = lookup("RECONNECT_JITTER_FACTOR") {
        config.reconnect.jitter_factor = val.parse()?;
    }

    debug!(
        exchange = %config.topology.exchange,
        queue = %config.topology.queue,
        "Applied environment overrides"
    );
    Ok(())
}
