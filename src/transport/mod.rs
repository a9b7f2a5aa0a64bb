//! Out-of-band retrieval of response bodies too large for an invocation result

mod object_store;
mod queue;

pub use object_store::{ObjectStore, S3ObjectStore};
pub use queue::{HttpMessageQueue, MessageQueue};

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{PayloadConfig, PayloadMode};
use crate::models::LargePayloadReference;
use crate::stats::{StatsRecorder, TransferStats, S3_MODEL, SQS_MODEL};

/// Large payload resolution failure
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("object {0} not found")]
    ObjectMissing(String),

    #[error("message {0} not found or expired")]
    MessageNotFound(String),

    #[error("worker returned a {found} reference but the {configured} transport is configured")]
    ModeMismatch {
        found: &'static str,
        configured: &'static str,
    },

    #[error("worker returned a large payload reference but no transport is configured")]
    NotConfigured,

    #[error("{0}")]
    Backend(String),
}

/// Resolves large payload references in the configured mode
pub enum LargePayloadTransport {
    Disabled,
    ObjectStore {
        store: Arc<dyn ObjectStore>,
        retain: bool,
        stats: Arc<TransferStats>,
    },
    Queue {
        queue: Arc<dyn MessageQueue>,
        stats: Arc<TransferStats>,
    },
}

impl LargePayloadTransport {
    pub fn from_config(
        config: &PayloadConfig,
        stats: &StatsRecorder,
    ) -> Result<Self, TransportError> {
        let transport = match config.mode {
            PayloadMode::None => Self::Disabled,
            PayloadMode::ObjectStore => Self::object_store(
                Arc::new(S3ObjectStore::from_config(config)?),
                config.s3_retain,
                stats,
            ),
            PayloadMode::Queue => {
                let url = config.queue_url.clone().ok_or(TransportError::NotConfigured)?;
                Self::queue(Arc::new(HttpMessageQueue::new(url)?), stats)
            }
        };
        info!(mode = transport.mode_name(), "Large payload transport ready");
        Ok(transport)
    }

    pub fn object_store(store: Arc<dyn ObjectStore>, retain: bool, stats: &StatsRecorder) -> Self {
        Self::ObjectStore {
            store,
            retain,
            stats: stats.transfer_model(S3_MODEL),
        }
    }

    pub fn queue(queue: Arc<dyn MessageQueue>, stats: &StatsRecorder) -> Self {
        Self::Queue {
            queue,
            stats: stats.transfer_model(SQS_MODEL),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Disabled => "none",
            Self::ObjectStore { .. } => "object-store",
            Self::Queue { .. } => "queue",
        }
    }

    /// Fetch the full body a reference points to.
    ///
    /// Fetched objects are deleted in the background unless retained; the
    /// caller never waits on deletion.
    pub async fn resolve(&self, reference: &LargePayloadReference) -> Result<Bytes, TransportError> {
        match (self, reference) {
            (Self::Disabled, _) => Err(TransportError::NotConfigured),
            (
                Self::ObjectStore {
                    store,
                    retain,
                    stats,
                },
                LargePayloadReference::ObjectKey(key),
            ) => {
                let body = store.fetch(key).await?;
                stats.record_fetch(body.len() as u64);
                if !*retain {
                    let store = Arc::clone(store);
                    let key = key.clone();
                    tokio::spawn(async move {
                        match store.delete(&key).await {
                            Ok(()) => debug!(key = %key, "Deleted payload object"),
                            Err(e) => warn!(key = %key, error = %e, "Failed to delete payload object"),
                        }
                    });
                }
                Ok(body)
            }
            (Self::Queue { queue, stats }, LargePayloadReference::MessageId(id)) => {
                let body = queue.receive(id).await?;
                stats.record_fetch(body.len() as u64);
                Ok(body)
            }
            (configured, found) => Err(TransportError::ModeMismatch {
                found: found.kind(),
                configured: configured.mode_name(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::{MessageQueue, ObjectStore, TransportError};

    #[derive(Default)]
    pub(crate) struct MemoryObjectStore {
        objects: Mutex<HashMap<String, Bytes>>,
    }

    impl MemoryObjectStore {
        pub(crate) fn put(&self, key: &str, body: Bytes) {
            self.objects.lock().insert(key.to_string(), body);
        }

        pub(crate) fn contains(&self, key: &str) -> bool {
            self.objects.lock().contains_key(key)
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn fetch(&self, key: &str) -> Result<Bytes, TransportError> {
            self.objects
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| TransportError::ObjectMissing(key.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), TransportError> {
            self.objects.lock().remove(key);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryQueue {
        messages: Mutex<HashMap<String, Bytes>>,
    }

    impl MemoryQueue {
        pub(crate) fn publish(&self, id: &str, body: Bytes) {
            self.messages.lock().insert(id.to_string(), body);
        }
    }

    #[async_trait]
    impl MessageQueue for MemoryQueue {
        async fn receive(&self, message_id: &str) -> Result<Bytes, TransportError> {
            self.messages
                .lock()
                .remove(message_id)
                .ok_or_else(|| TransportError::MessageNotFound(message_id.to_string()))
        }
    }
}
