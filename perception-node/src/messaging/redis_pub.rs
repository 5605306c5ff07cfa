use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::EventPublisher;
use crate::error::{PerceptionError, Result};
use gatewatch_common::Event;

/// Publishes each event as a JSON string on a Redis pub/sub channel.
///
/// The connection is opened lazily and dropped after a failed or timed out
/// command so the next publish reconnects. Connecting and publishing are each
/// bounded by `publish_timeout`.
pub struct RedisPublisher {
    client: redis::Client,
    channel: String,
    publish_timeout: Duration,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisPublisher {
    pub fn new(redis_url: &str, channel: &str, publish_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        info!("Redis publisher configured for channel {}", channel);
        Ok(Self {
            client,
            channel: channel.to_string(),
            publish_timeout,
            conn: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            return Ok(conn.clone());
        }

        // Lock released while connecting.
        let conn = timeout(self.publish_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| PerceptionError::Timeout(format!("redis connect after {:?}", self.publish_timeout)))??;

        let mut guard = self.conn.lock().await;
        match guard.as_ref() {
            Some(existing) => Ok(existing.clone()),
            None => {
                info!("Connected to Redis");
                *guard = Some(conn.clone());
                Ok(conn)
            }
        }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    #[instrument(skip(self, event), fields(event = %event.event, track_id = event.data.track_id), level = "debug")]
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connection().await?;

        let result: Result<()> = match timeout(self.publish_timeout, conn.publish::<_, _, i64>(&self.channel, payload)).await {
            Ok(Ok(receivers)) => {
                debug!(receivers, "Published event");
                return Ok(());
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PerceptionError::Timeout(format!("redis publish after {:?}", self.publish_timeout))),
        };

        warn!("Redis publish failed, dropping connection");
        self.conn.lock().await.take();
        result
    }
}
