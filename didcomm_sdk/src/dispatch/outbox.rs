use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::storage::{StorageError, Store};

pub const OUTBOX_STORE: &str = "outbox";

/// A packed envelope awaiting transport acknowledgement.
///
/// Entries are written before the owning state transition is persisted and
/// removed only after the transport accepted the bytes, so a crash in
/// between replays the send instead of losing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub endpoint: Url,
    pub envelope: Vec<u8>,
    pub queued_at_ms: u128,
}

/// Store-backed FIFO of undelivered envelopes.
pub struct Outbox {
    store: Arc<dyn Store>,
}

impl Outbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Outbox { store }
    }

    /// Durably enqueue an envelope; returns the entry id to remove on
    /// delivery.
    pub async fn push(&self, endpoint: &Url, envelope: &[u8]) -> Result<String, StorageError> {
        let entry = OutboxEntry {
            id: Uuid::new_v4().to_string(),
            endpoint: endpoint.clone(),
            envelope: envelope.to_vec(),
            queued_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
        };

        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| StorageError::Backend(format!("encode outbox entry: {e}")))?;
        self.store.put(&entry.id, &bytes).await?;

        Ok(entry.id)
    }

    pub async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.store.delete(id).await
    }

    /// All undelivered entries in enqueue order.
    pub async fn pending(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        let mut entries: Vec<OutboxEntry> = self
            .store
            .scan_prefix("")
            .await?
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect();

        entries.sort_by_key(|e| e.queued_at_ms);

        Ok(entries)
    }
}
