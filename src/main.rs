use std::path::Path;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chat_broker::config::{create_default_config_file, load_config, BrokerConfig};
use chat_broker::env::apply_env_overrides;
use chat_broker::{ChatBroker, CombinedEvent, OutboundKind};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if std::env::args().any(|arg| arg == "--init-config") {
        create_default_config_file(Path::new("ChatBroker.json"))?;
        return Ok(());
    }

    let mut config = load_config().unwrap_or_else(|e| {
        warn!(error = %e, "No usable config file, using defaults");
        BrokerConfig::default()
    });
    apply_env_overrides(&mut config)?;
    config.validate()?;

    let broker = ChatBroker::with_lapin(config);
    broker.start().await;

    let replies = broker.publisher();
    broker
        .on_inbound(move |event: CombinedEvent| {
            let replies = replies.clone();
            async move {
                info!(
                    partition_key = %event.partition_key,
                    events = event.event_count,
                    "Received chat batch"
                );
                replies
                    .publish(
                        OutboundKind::Status,
                        json!({
                            "partitionKey": event.partition_key,
                            "batchId": event.batch_id,
                            "status": "received",
                            "messageIds": event.message_ids,
                        }),
                    )
                    .await;
                Ok::<(), anyhow::Error>(())
            }
        })
        .await?;

    info!("ChatBroker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!(status = %serde_json::to_string(&broker.status())?, "Final broker status");
    broker.shutdown().await?;
    Ok(())
}
