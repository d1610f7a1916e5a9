use std::sync::Arc;

use tracing::debug;

use super::message::{FIELD_RESOURCE, FIELD_TYPE, MessageKind};
use crate::cache::{CacheStore, StoreError};

/// Producer side of the invalidation log.
#[derive(Clone)]
pub struct InvalidationPublisher {
    store: Arc<dyn CacheStore>,
    stream: String,
}

impl InvalidationPublisher {
    pub fn new(store: Arc<dyn CacheStore>, stream: impl Into<String>) -> Self {
        Self {
            store,
            stream: stream.into(),
        }
    }

    /// Append a message announcing `kind` for `iri`; returns the message id.
    pub async fn publish(&self, kind: &MessageKind, iri: &str) -> Result<String, StoreError> {
        let id = self
            .store
            .append(
                &self.stream,
                &[(FIELD_TYPE, kind.as_str()), (FIELD_RESOURCE, iri)],
            )
            .await?;
        debug!(stream = %self.stream, message_id = %id, kind = %kind, iri, "Published invalidation");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    #[tokio::test]
    async fn published_messages_land_on_the_stream() {
        let store = Arc::new(MemoryStore::new());
        let publisher = InvalidationPublisher::new(store.clone(), "transactions");

        let first = publisher
            .publish(&MessageKind::Updated, "https://ex/1")
            .await
            .expect("publish");
        let second = publisher
            .publish(&MessageKind::Deleted, "https://ex/2")
            .await
            .expect("publish");

        assert_ne!(first, second);
        assert_eq!(store.stream_len("transactions"), 2);
    }
}
