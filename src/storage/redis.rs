//! Redis backed store shared by several replicas.
//!
//! Writes are `SET` followed by a `PUBLISH` on the notification channel.
//! Each instance tags its messages with a random id and ignores its own.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{BroadcastStore, EventStore, Store, StoreNotification};
use crate::error::StoreError;

pub const DEFAULT_CHANNEL: &str = "overrides-updates";
const DEFAULT_PORT: u16 = 6379;
const NOTIFICATION_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `host:port` or a full `redis://` url.
    pub address: String,
    pub password: Option<String>,
    pub db: i64,
    pub channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: format!("localhost:{}", DEFAULT_PORT),
            password: None,
            db: 0,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl RedisConfig {
    fn client(&self) -> Result<redis::Client, StoreError> {
        if self.address.starts_with("redis://") || self.address.starts_with("rediss://") {
            return Ok(redis::Client::open(self.address.as_str())?);
        }

        let (host, port) = match self.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| StoreError::Backend(format!("invalid redis address: {}", self.address)))?;
                (host.to_string(), port)
            }
            None => (self.address.clone(), DEFAULT_PORT),
        };

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..Default::default()
            },
        };
        Ok(redis::Client::open(info)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    key: String,
    #[serde(with = "base64_data")]
    data: Vec<u8>,
    instance_id: String,
}

/// Message bodies travel as standard base64 text; `null` reads as empty.
mod base64_data {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => general_purpose::STANDARD
                .decode(text)
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
    connection: MultiplexedConnection,
    channel: String,
    instance_id: String,
}

impl RedisStore {
    pub async fn connect(config: RedisConfig) -> Result<Self, StoreError> {
        let client = config.client()?;
        let connection = client.get_multiplexed_async_connection().await?;
        let instance_id = uuid::Uuid::new_v4().to_string();
        info!(channel = %config.channel, instance_id = %instance_id, "connected to redis");

        Ok(Self {
            client,
            connection,
            channel: config.channel,
            instance_id,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let payload = encode_notification(key, data, &self.instance_id)?;
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }
}

fn encode_notification(key: &str, data: &[u8], instance_id: &str) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(&Message {
        key: key.to_string(),
        data: data.to_vec(),
        instance_id: instance_id.to_string(),
    })?)
}

/// Decodes a channel payload, dropping malformed messages and the ones this
/// instance published itself.
pub fn decode_notification(payload: &[u8], own_instance_id: &str) -> Option<StoreNotification> {
    let message: Message = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "invalid store notification payload");
            return None;
        }
    };
    if message.instance_id == own_instance_id {
        return None;
    }
    Some(StoreNotification {
        key: message.key,
        data: message.data,
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        value.ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.set::<_, _, ()>(key, data).await?;
        self.publish(key, data).await
    }

    fn as_event_store(&self) -> Option<&dyn EventStore> {
        Some(self)
    }

    fn as_broadcast_store(&self) -> Option<&dyn BroadcastStore> {
        Some(self)
    }
}

#[async_trait]
impl EventStore for RedisStore {
    async fn subscribe(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<StoreNotification>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let instance_id = self.instance_id.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!(channel = %channel, "redis subscription closed");
                            break;
                        };
                        let Some(notification) = decode_notification(msg.get_payload_bytes(), &instance_id) else {
                            continue;
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(channel = %channel, "redis listener stopped");
        });

        Ok(rx)
    }
}

#[async_trait]
impl BroadcastStore for RedisStore {
    async fn broadcast(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.publish(key, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_messages_are_ignored() {
        let payload = encode_notification("overrides", b"{}", "me").unwrap();
        assert!(decode_notification(&payload, "me").is_none());

        let notification = decode_notification(&payload, "someone-else").unwrap();
        assert_eq!(notification.key, "overrides");
        assert_eq!(notification.data, b"{}".to_vec());
    }

    #[test]
    fn test_message_data_is_base64_text() {
        let payload = encode_notification("paused", b"true", "me").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["data"], "dHJ1ZQ==");
        assert_eq!(value["instance_id"], "me");

        let foreign = br#"{"key":"overrides","data":"e30=","instance_id":"other"}"#;
        let notification = decode_notification(foreign, "me").unwrap();
        assert_eq!(notification.data, b"{}".to_vec());

        let empty = br#"{"key":"webhook-received","data":null,"instance_id":"other"}"#;
        assert!(decode_notification(empty, "me").unwrap().data.is_empty());

        assert!(decode_notification(br#"{"key":"k","data":"%%","instance_id":"other"}"#, "me").is_none());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        assert!(decode_notification(b"not json", "me").is_none());
        assert!(decode_notification(br#"{"key":"overrides"}"#, "me").is_none());
    }

    #[test]
    fn test_client_from_host_port() {
        let config = RedisConfig {
            address: "cache.internal:6380".into(),
            password: Some("secret".into()),
            db: 2,
            ..Default::default()
        };
        let client = config.client().unwrap();
        let info = client.get_connection_info();
        assert!(matches!(&info.addr, ConnectionAddr::Tcp(host, 6380) if host == "cache.internal"));
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let config = RedisConfig {
            address: "cache.internal:port".into(),
            ..Default::default()
        };
        assert!(config.client().is_err());
    }
}
