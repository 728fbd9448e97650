//! Backend capability surface over a K/V + pub/sub store.
//!
//! The hub depends on exactly this set of operations: an atomic counter, a
//! TTL'd two-field hash, per-dataset notification channels, and prefix
//! listing. Any store that preserves the commit-then-publish boundary can
//! back the hub.

use crate::error::BackendError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;

/// Prefix under which dataset sequence counters live.
pub const SEQ_PREFIX: &str = "seq_num:";

/// Key for a dataset's sequence counter.
pub fn seq_key(node_id: &str) -> String {
    format!("seq_num:{node_id}")
}

/// Key for a committed frame.
pub fn data_key(node_id: &str, seq: u64) -> String {
    format!("data:{node_id}:{seq}")
}

/// Channel carrying live sequence notifications for a dataset.
pub fn notify_channel(node_id: &str) -> String {
    format!("notify:{node_id}")
}

/// A frame as stored in the backend: UTF-8 JSON metadata bytes plus the
/// opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFrame {
    pub metadata: Bytes,
    pub payload: Bytes,
}

/// A live notification subscription.
///
/// Dropping the subscription releases the underlying backend resources.
pub struct Subscription {
    inner: BoxStream<'static, Result<u64, BackendError>>,
}

impl Subscription {
    pub fn new(inner: BoxStream<'static, Result<u64, BackendError>>) -> Self {
        Self { inner }
    }

    /// Receive the next notification, or `None` when the stream ends.
    pub async fn next(&mut self) -> Option<Result<u64, BackendError>> {
        self.inner.next().await
    }
}

/// The minimum capability set the hub depends on.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Set `key` to 0 only if it does not exist. Idempotent.
    async fn counter_init_if_absent(&self, key: &str) -> Result<(), BackendError>;

    /// Atomic post-increment, returning the new value.
    ///
    /// Implementations may coalesce with init, treating an absent key as 0.
    async fn counter_incr(&self, key: &str) -> Result<u64, BackendError>;

    async fn counter_get(&self, key: &str) -> Result<Option<u64>, BackendError>;

    async fn counter_delete(&self, key: &str) -> Result<(), BackendError>;

    /// Write both frame fields with the TTL applied in the same operation.
    async fn hash_put(
        &self,
        key: &str,
        frame: StoredFrame,
        ttl: Duration,
    ) -> Result<(), BackendError>;

    /// Read a stored frame. Returns `None` if the key is missing or expired.
    async fn hash_get(&self, key: &str) -> Result<Option<StoredFrame>, BackendError>;

    /// Publish a sequence notification on a channel.
    async fn publish(&self, channel: &str, seq: u64) -> Result<(), BackendError>;

    /// Subscribe to a channel's notifications.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError>;

    /// List keys under a prefix.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError>;
}
