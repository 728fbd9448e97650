//! In-process backend used for tests and single-node deployments.

use crate::backend::{Backend, StoredFrame, Subscription};
use crate::error::BackendError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    frame: StoredFrame,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    counters: HashMap<String, u64>,
    frames: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<u64>>,
}

/// Backend keeping all state in process memory.
///
/// Frames expire lazily: an expired entry is dropped on the next read of its
/// key. Notifications use one broadcast channel per dataset; a notification
/// published while nobody is subscribed is lost, which matches the
/// best-effort contract.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn counter_init_if_absent(&self, key: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.counters.entry(key.to_string()).or_insert(0);
        Ok(())
    }

    async fn counter_incr(&self, key: &str) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        // Coalesced with init: an absent key counts from 0, as Redis INCR does.
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn counter_get(&self, key: &str) -> Result<Option<u64>, BackendError> {
        Ok(self.state.lock().counters.get(key).copied())
    }

    async fn counter_delete(&self, key: &str) -> Result<(), BackendError> {
        self.state.lock().counters.remove(key);
        Ok(())
    }

    async fn hash_put(
        &self,
        key: &str,
        frame: StoredFrame,
        ttl: Duration,
    ) -> Result<(), BackendError> {
        let entry = Entry {
            frame,
            expires_at: Instant::now() + ttl,
        };
        self.state.lock().frames.insert(key.to_string(), entry);
        Ok(())
    }

    async fn hash_get(&self, key: &str) -> Result<Option<StoredFrame>, BackendError> {
        let mut state = self.state.lock();
        match state.frames.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.frame.clone())),
            Some(_) => {
                state.frames.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, seq: u64) -> Result<(), BackendError> {
        let state = self.state.lock();
        if let Some(sender) = state.channels.get(channel) {
            // A send error just means no subscriber is listening right now.
            let _ = sender.send(seq);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackendError> {
        let receiver = {
            let mut state = self.state.lock();
            state
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let channel = channel.to_string();
        let stream = BroadcastStream::new(receiver)
            .filter_map(move |result| {
                let channel = channel.clone();
                async move {
                    match result {
                        Ok(seq) => Some(Ok(seq)),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            warn!(%channel, skipped, "subscriber lagged; notifications dropped");
                            None
                        }
                    }
                }
            })
            .boxed();
        Ok(Subscription::new(stream))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .counters
            .keys()
            .chain(state.frames.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
