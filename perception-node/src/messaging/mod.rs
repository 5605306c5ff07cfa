pub mod redis_pub;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::MessagingConfig;
use crate::error::Result;
use gatewatch_common::Event;

pub use redis_pub::RedisPublisher;

/// Append-only sink for lifecycle events. Delivery is at-most-once: callers
/// log failures and move on.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
}

/// Writes events to the log instead of a broker. Used when messaging is disabled.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &Event) -> Result<()> {
        info!(
            camera = %event.data.camera,
            track_id = event.data.track_id,
            event = %event.event,
            "{}",
            serde_json::to_string(event)?
        );
        Ok(())
    }
}

pub fn create_publisher(config: &MessagingConfig) -> Result<Arc<dyn EventPublisher>> {
    if !config.enabled {
        info!("Messaging disabled, events go to the log");
        return Ok(Arc::new(LogPublisher));
    }
    Ok(Arc::new(RedisPublisher::new(
        &config.redis_url,
        &config.channel,
        config.publish_timeout(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatewatch_common::EventKind;

    #[tokio::test]
    async fn test_log_publisher_accepts_events() {
        let publisher = create_publisher(&MessagingConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        let event = Event::new(EventKind::TrackCreated, 1.0, "cam1", 1);
        publisher.publish(&event).await.unwrap();
    }

    #[test]
    fn test_rejects_bad_redis_url() {
        let result = create_publisher(&MessagingConfig {
            enabled: true,
            redis_url: "not-a-url".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
