//! Message bus adapter on Redis pub/sub.
//!
//! Cortex publishes pipeline traces and `feature/<table>/synced` events and
//! subscribes to upstream `data/<metric>/synced` topics. The bus contract
//! is at-least-once, not retained; every publish-side caller treats a bus
//! failure as non-fatal.
//!
//! A single shared connection serves all publishes, guarded by an internal
//! mutex. Publishes retry with a bounded attempt count before surfacing the
//! error; subscriptions get their own dedicated pub/sub connection.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio_stream::StreamExt;

use crate::metrics::recorder::MetricsRecorder;

/// Topic for a finished pipeline run in the given domain.
pub fn pipeline_finished_topic(domain: &str) -> String {
    format!("cortex/scheduler/{}/pipeline/finished", domain)
}

/// Topic announcing that a feature table has been refilled.
pub fn table_synced_topic(table: &str) -> String {
    format!("feature/{}/synced", table)
}

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Failed to connect to the bus.
    #[error("Bus connection failed: {0}")]
    ConnectionFailed(String),

    /// A bus operation failed.
    #[error("Bus operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Payload serialization failed.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// All publish attempts were exhausted.
    #[error("Publish to '{topic}' failed after {attempts} attempts: {last_error}")]
    PublishExhausted {
        topic: String,
        attempts: u32,
        last_error: String,
    },
}

/// A message received on a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes; often empty for sync notifications.
    pub payload: Vec<u8>,
}

/// Shared pub/sub client.
pub struct MessageBus {
    client: redis::Client,
    publish_conn: tokio::sync::Mutex<ConnectionManager>,
    max_attempts: u32,
    recorder: MetricsRecorder,
}

impl MessageBus {
    /// Connects to the bus.
    ///
    /// # Arguments
    ///
    /// * `bus_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `max_attempts` - publish attempts before the error surfaces
    ///
    /// # Errors
    ///
    /// Returns `BusError::ConnectionFailed` if the connection fails.
    pub async fn connect(bus_url: &str, max_attempts: u32) -> Result<Self, BusError> {
        let client = redis::Client::open(bus_url)
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            publish_conn: tokio::sync::Mutex::new(publish_conn),
            max_attempts: max_attempts.max(1),
            recorder: MetricsRecorder::new(),
        })
    }

    /// Publishes a JSON payload to a topic.
    ///
    /// The shared connection is held for the duration of the publish. The
    /// connection manager re-establishes dropped connections; each attempt
    /// after a failure goes through a fresh send.
    pub async fn publish_json<T: serde::Serialize>(
        &self,
        topic: &str,
        payload: &T,
    ) -> Result<(), BusError> {
        let body = serde_json::to_vec(payload)?;
        self.publish(topic, body).await
    }

    /// Publishes raw bytes to a topic with bounded retry.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.publish_conn.lock().await;

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match conn.publish::<_, _, ()>(topic, payload.clone()).await {
                Ok(()) => {
                    self.recorder.record_bus_publish(topic, true);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        topic = topic,
                        attempt = attempt,
                        error = %e,
                        "Bus publish attempt failed"
                    );
                }
            }
        }

        self.recorder.record_bus_publish(topic, false);
        Err(BusError::PublishExhausted {
            topic: topic.to_string(),
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Subscribes to a set of topics on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns `BusError` if the subscription connection cannot be
    /// established.
    pub async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BusError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| BusError::ConnectionFailed(e.to_string()))?;

        let mut pubsub = conn.into_pubsub();
        for topic in topics {
            pubsub.subscribe(topic).await?;
        }

        tracing::info!(topics = topics.len(), "Bus subscription established");

        Ok(Subscription {
            stream: Box::pin(pubsub.into_on_message()),
        })
    }
}

/// An active subscription delivering [`BusMessage`]s.
pub struct Subscription {
    stream: std::pin::Pin<Box<dyn futures::Stream<Item = redis::Msg> + Send>>,
}

impl Subscription {
    /// Waits for the next message. Returns `None` when the subscription
    /// connection is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        let msg = self.stream.next().await?;
        let topic = msg.get_channel_name().to_string();
        let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
        Some(BusMessage { topic, payload })
    }
}
