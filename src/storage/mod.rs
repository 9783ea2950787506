//! Persistence backends for override state.
//!
//! Every backend is a [`Store`]. Backends shared between replicas also
//! implement [`EventStore`] (notifications of writes made elsewhere) and
//! [`BroadcastStore`] (signals that are not persisted).

pub mod file;
pub mod memory;
pub mod null;
pub mod redis;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::StoreError;

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
pub use self::null::NullStore;
pub use self::redis::{RedisConfig, RedisStore};

/// Key holding the serialized override map.
pub const OVERRIDES_KEY: &str = "overrides";
/// Key holding the serialized pause flag.
pub const PAUSED_KEY: &str = "paused";
/// Signal sent to sibling replicas when a webhook arrives.
pub const WEBHOOK_KEY: &str = "webhook-received";

/// Key holding the last fetched raw snapshot of one environment.
pub fn backup_key(environment_index: usize) -> String {
    format!("backup-{}", environment_index)
}

/// Key/value storage. Implementations must be thread-safe.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn write(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    fn as_event_store(&self) -> Option<&dyn EventStore> {
        None
    }

    fn as_broadcast_store(&self) -> Option<&dyn BroadcastStore> {
        None
    }
}

/// A write made by another replica.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreNotification {
    pub key: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait EventStore: Store {
    /// Starts listening for writes from other replicas. The listener stops
    /// when `shutdown` flips to `true` or its sender is dropped.
    async fn subscribe(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<StoreNotification>, StoreError>;
}

#[async_trait]
pub trait BroadcastStore: Store {
    /// Sends a notification to other replicas without persisting it.
    async fn broadcast(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;
}
