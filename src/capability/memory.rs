//! Memory capability: append-only per-agent history, newest-first recall
//! (§3 `MemoryEntry`, §4.2 stage 2).

use async_trait::async_trait;

use crate::errors::RunnerError;
use crate::models::MemoryEntry;

#[async_trait]
pub trait Memory: Send + Sync {
    async fn append(&self, entry: MemoryEntry) -> Result<(), RunnerError>;

    /// Newest-first, bounded by `limit` (§4.2: "`limit` is small and
    /// configurable").
    async fn recall(&self, limit: usize) -> Result<Vec<MemoryEntry>, RunnerError>;
}

/// The production `Memory` implementation: a thin, per-agent view over
/// the shared persistence contract's `append_memory`/`recall_memory`
/// (§4.5). Unlike the other four capabilities, memory's concrete form is
/// in scope — it is the persistence contract itself, not an external
/// collaborator.
pub struct StoreMemory {
    store: std::sync::Arc<dyn crate::persistence::PersistenceStore>,
    token_id: crate::models::TokenId,
}

impl StoreMemory {
    pub fn new(
        store: std::sync::Arc<dyn crate::persistence::PersistenceStore>,
        token_id: crate::models::TokenId,
    ) -> Self {
        Self { store, token_id }
    }
}

#[async_trait]
impl Memory for StoreMemory {
    async fn append(&self, mut entry: MemoryEntry) -> Result<(), RunnerError> {
        entry.token_id = self.token_id;
        self.store.append_memory(entry).await
    }

    async fn recall(&self, limit: usize) -> Result<Vec<MemoryEntry>, RunnerError> {
        self.store.recall_memory(self.token_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionResult, MemoryEntryType};
    use crate::persistence::sqlite::SqliteStore;

    #[tokio::test]
    async fn store_memory_round_trips_and_stamps_token_id() {
        let store = std::sync::Arc::new(SqliteStore::open_in_memory().unwrap());
        let memory = StoreMemory::new(store, 42);

        memory
            .append(MemoryEntry {
                token_id: 0, // deliberately wrong; append() must overwrite it
                entry_type: MemoryEntryType::Observation,
                action: None,
                params: None,
                result: None::<ExecutionResult>,
                reasoning: None,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let recalled = memory.recall(10).await.unwrap();
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].token_id, 42);
    }
}
