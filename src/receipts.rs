//! In-memory view of who has read what.
//!
//! The message store owns read-by state; this cache holds what the store
//! last reported for a message and loads it on first lookup. Updates and
//! loads for one message id are applied one at a time.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use uuid::Uuid;

use crate::{
    error::ChatResult,
    messages::{MessageStore, ReadState},
};

#[derive(Default)]
struct Slot {
    serial: tokio::sync::Mutex<()>,
    // None until the store has been consulted
    readers: RwLock<Option<Vec<String>>>,
}

impl Slot {
    fn cached(&self) -> Option<Vec<String>> {
        self.readers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn fill(&self, read_by: Vec<String>) {
        *self.readers.write().unwrap_or_else(PoisonError::into_inner) = Some(read_by);
    }
}

#[derive(Clone, Default)]
pub struct ReceiptTracker {
    slots: Arc<DashMap<Uuid, Arc<Slot>>>,
}

impl ReceiptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the read in `store`, refreshes the cached set and hands the
    /// full result to `publish` before the next read of the same message
    /// can start.
    pub async fn record_read<F>(
        &self,
        store: &MessageStore,
        message_id: Uuid,
        username: &str,
        publish: F,
    ) -> ChatResult<ReadState>
    where
        F: FnOnce(&ReadState),
    {
        let slot = self.slot(message_id);
        let _serial = slot.serial.lock().await;

        let state = match store.mark_read(message_id, username).await {
            Ok(state) => state,
            Err(err) => {
                self.drop_unloaded(message_id);
                return Err(err);
            }
        };

        slot.fill(state.read_by.clone());
        publish(&state);
        Ok(state)
    }

    /// Readers of `message_id`, loaded from `store` on a miss. Unknown or
    /// expired messages have no readers.
    pub async fn readers_of(&self, store: &MessageStore, message_id: Uuid) -> ChatResult<Vec<String>> {
        if let Some(readers) = self.slots.get(&message_id).and_then(|slot| slot.cached()) {
            return Ok(readers);
        }

        let slot = self.slot(message_id);
        let _serial = slot.serial.lock().await;
        if let Some(readers) = slot.cached() {
            return Ok(readers);
        }

        match store.read_state(message_id).await {
            Ok(Some(state)) => {
                slot.fill(state.read_by.clone());
                Ok(state.read_by)
            }
            Ok(None) => {
                self.drop_unloaded(message_id);
                Ok(Vec::new())
            }
            Err(err) => {
                self.drop_unloaded(message_id);
                Err(err)
            }
        }
    }

    /// Drops cached sets for messages the store has purged.
    pub fn forget(&self, message_ids: &[Uuid]) {
        for id in message_ids {
            self.slots.remove(id);
        }
    }

    fn slot(&self, message_id: Uuid) -> Arc<Slot> {
        self.slots.entry(message_id).or_default().clone()
    }

    fn drop_unloaded(&self, message_id: Uuid) {
        self.slots
            .remove_if(&message_id, |_, slot| slot.cached().is_none());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.len()
    }
}
