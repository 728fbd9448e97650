//! Dataset allocation, lookup, and teardown.

use crate::backend::{self, Backend};
use crate::error::HubError;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

/// Upper bound (exclusive) for randomly allocated dataset ids.
const NODE_ID_SPACE: u64 = 1_000_000;

/// Allocates and tears down per-dataset state.
///
/// A dataset exists iff its sequence counter exists; the registry never
/// touches frames, which age out under their own TTL.
#[derive(Clone)]
pub struct Registry {
    backend: Arc<dyn Backend>,
}

impl Registry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Allocate a new dataset and return its id.
    ///
    /// Ids are random; a collision with a live dataset is accepted silently
    /// since the counter init is idempotent.
    pub async fn create(&self) -> Result<u64, HubError> {
        let node_id = rand::thread_rng().gen_range(0..NODE_ID_SPACE);
        self.backend
            .counter_init_if_absent(&backend::seq_key(&node_id.to_string()))
            .await?;
        debug!(node_id, "dataset allocated");
        Ok(node_id)
    }

    /// Whether the dataset's counter exists.
    pub async fn exists(&self, node_id: &str) -> Result<bool, HubError> {
        let counter = self.backend.counter_get(&backend::seq_key(node_id)).await?;
        Ok(counter.is_some())
    }

    /// End a dataset's lifetime.
    ///
    /// Extant frames continue to age out under TTL. A second delete against
    /// the same id reports the dataset as unknown.
    pub async fn delete(&self, node_id: &str) -> Result<(), HubError> {
        if !self.exists(node_id).await? {
            return Err(HubError::UnknownDataset {
                node_id: node_id.to_string(),
            });
        }
        self.backend
            .counter_delete(&backend::seq_key(node_id))
            .await?;
        debug!(node_id, "dataset deleted");
        Ok(())
    }

    /// List ids of datasets with a live counter.
    pub async fn list_live(&self) -> Result<Vec<String>, HubError> {
        let keys = self.backend.keys_with_prefix(backend::SEQ_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(backend::SEQ_PREFIX))
            .map(str::to_string)
            .collect())
    }
}
