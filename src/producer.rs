//! Append pipeline and end-of-stream marker.

use crate::backend::{self, Backend, StoredFrame};
use crate::config::Settings;
use crate::error::HubError;
use bytes::Bytes;
use chrono::Local;
use http::HeaderMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Payload bytes of the end-of-stream sentinel frame.
pub const SENTINEL_PAYLOAD: &[u8] = b"null";

/// Commits frames to a dataset and fans out their notifications.
///
/// The commit order is fixed: allocate the next sequence, write the frame
/// with its TTL, then publish. A subscriber that observes the notification
/// can therefore always read the frame.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn Backend>,
    settings: Arc<Settings>,
}

impl Producer {
    pub fn new(backend: Arc<dyn Backend>, settings: Arc<Settings>) -> Self {
        Self { backend, settings }
    }

    /// Append a frame. Returns the committed sequence number.
    ///
    /// Size limits are checked before any side effect; a rejected request
    /// leaves the sequence counter untouched.
    pub async fn append(
        &self,
        node_id: &str,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<u64, HubError> {
        if body.len() > self.settings.max_payload_size {
            return Err(HubError::PayloadTooLarge {
                size: body.len(),
                limit: self.settings.max_payload_size,
            });
        }
        for (name, value) in headers {
            if value.len() > self.settings.max_header_size {
                return Err(HubError::HeaderTooLarge {
                    name: name.to_string(),
                    limit: self.settings.max_header_size,
                });
            }
        }

        let mut metadata = serde_json::Map::new();
        metadata.insert("timestamp".to_string(), json!(now_iso8601()));
        if let Some(content_type) = headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
        {
            metadata.insert("Content-Type".to_string(), json!(content_type));
        }

        self.commit(node_id, Value::Object(metadata), body).await
    }

    /// Write the end-of-stream sentinel, carrying `reason` verbatim.
    ///
    /// Closing a dataset that does not exist is an error.
    pub async fn close(&self, node_id: &str, reason: Option<String>) -> Result<u64, HubError> {
        let counter = self
            .backend
            .counter_get(&backend::seq_key(node_id))
            .await?;
        if counter.is_none() {
            return Err(HubError::UnknownDataset {
                node_id: node_id.to_string(),
            });
        }

        let metadata = json!({
            "timestamp": now_iso8601(),
            "reason": reason,
        });
        self.commit(node_id, metadata, Bytes::from_static(SENTINEL_PAYLOAD))
            .await
    }

    async fn commit(
        &self,
        node_id: &str,
        metadata: Value,
        payload: Bytes,
    ) -> Result<u64, HubError> {
        let seq = self
            .backend
            .counter_incr(&backend::seq_key(node_id))
            .await?;

        let frame = StoredFrame {
            metadata: serde_json::to_vec(&metadata).unwrap_or_default().into(),
            payload,
        };
        self.backend
            .hash_put(&backend::data_key(node_id, seq), frame, self.settings.ttl)
            .await?;

        // Notifications are best-effort; a failed publish must not fail the
        // append. Subscribers that missed it can still replay the frame.
        if let Err(err) = self
            .backend
            .publish(&backend::notify_channel(node_id), seq)
            .await
        {
            warn!(node_id, seq, %err, "publish failed; live subscribers will miss this frame");
        }

        debug!(node_id, seq, "frame committed");
        Ok(seq)
    }
}

fn now_iso8601() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
