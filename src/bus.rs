//! Message bus client
//!
//! Wraps the NATS client: connect with the configured timeouts, subscribe
//! on a queue group, request/reply, and JetStream KV access. Reconnection
//! is driven by the library; subscriptions survive a reconnect without the
//! application resubscribing.

use async_trait::async_trait;
use async_nats::jetstream;
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

use crate::config::NatsConfig;
use crate::{Error, Result};

/// Shared bus connection handle.
///
/// Process-wide state: constructed once at startup, cloned into every
/// task, torn down only at shutdown. The underlying client serializes
/// writes internally.
#[derive(Clone)]
pub struct BusClient {
    client: async_nats::Client,
}

impl BusClient {
    /// Connect to the bus with the configured URL and retry policy.
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let reconnect_wait = config.reconnect_wait;
        let client = async_nats::ConnectOptions::new()
            .name(env!("CARGO_PKG_NAME"))
            .connection_timeout(config.timeout)
            .request_timeout(Some(config.timeout))
            .max_reconnects(config.max_reconnect)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .connect(config.url.as_str())
            .await
            .map_err(|e| Error::Unexpected(format!("nats connect: {e}")))?;

        info!(url = %config.url, "connected to message bus");
        Ok(Self { client })
    }

    /// Subscribe to `subject` as a member of `queue_group`.
    pub async fn queue_subscribe(
        &self,
        subject: String,
        queue_group: String,
    ) -> Result<async_nats::Subscriber> {
        self.client
            .queue_subscribe(subject, queue_group)
            .await
            .map_err(|e| Error::Unexpected(format!("nats subscribe: {e}")))
    }

    /// Publish `payload` to `subject` (used for replies).
    pub async fn publish(&self, subject: async_nats::Subject, payload: Bytes) -> Result<()> {
        self.client
            .publish(subject, payload)
            .await
            .map_err(|e| Error::Unexpected(format!("nats publish: {e}")))
    }

    /// Request/reply with the connection's request timeout.
    pub async fn request(&self, subject: String, payload: Bytes) -> Result<async_nats::Message> {
        self.client.request(subject, payload).await.map_err(|e| {
            if matches!(e.kind(), async_nats::client::RequestErrorKind::TimedOut) {
                Error::Retryable {
                    status: None,
                    message: format!("nats request: {e}"),
                }
            } else {
                Error::Unexpected(format!("nats request: {e}"))
            }
        })
    }

    /// Open (or create) the JetStream KV bucket `bucket`.
    pub async fn key_value(&self, bucket: &str) -> Result<jetstream::kv::Store> {
        let js = jetstream::new(self.client.clone());

        if let Ok(store) = js.get_key_value(bucket).await {
            return Ok(store);
        }

        js.create_key_value(jetstream::kv::Config {
            bucket: bucket.to_string(),
            history: 1,
            ..Default::default()
        })
        .await
        .map_err(|e| Error::Unexpected(format!("kv bucket {bucket}: {e}")))
    }

    /// Flush and drain the connection; pending messages are delivered
    /// before the subscriptions close.
    pub async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|e| Error::Unexpected(format!("nats drain: {e}")))
    }
}

/// Key/value operations the local adapter needs from the bucket.
///
/// A seam over JetStream KV so the store logic is testable without a
/// running bus.
#[async_trait]
pub trait KeyValue: Send + Sync {
    /// Read a key. `None` when absent or deleted.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a key, returning the new revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All live keys in the bucket.
    async fn keys(&self) -> Result<Vec<String>>;
}


#[async_trait]
impl KeyValue for jetstream::kv::Store {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        jetstream::kv::Store::get(self, key)
            .await
            .map_err(|e| Error::Unexpected(format!("kv get: {e}")))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        jetstream::kv::Store::put(self, key, value)
            .await
            .map_err(|e| Error::Unexpected(format!("kv put: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        jetstream::kv::Store::delete(self, key)
            .await
            .map_err(|e| Error::Unexpected(format!("kv delete: {e}")))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut stream = jetstream::kv::Store::keys(self)
            .await
            .map_err(|e| Error::Unexpected(format!("kv keys: {e}")))?;

        let mut keys = Vec::new();
        while let Some(key) = stream.next().await {
            keys.push(key.map_err(|e| Error::Unexpected(format!("kv keys: {e}")))?);
        }
        Ok(keys)
    }
}
