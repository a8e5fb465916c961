//! Service state: the table registry, chunk store, and tables-state-id
//! described in spec §3/§4.9. Installed once at startup and read-only
//! afterwards, so lookups need no locking (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;

use replay_common::error::Result;

use crate::checkpointer::Checkpointer;
use crate::chunk_store::ChunkStore;
use crate::table::Table;

/// Immutable-after-init service state shared by every RPC handler.
pub struct ServiceState {
    pub tables: HashMap<String, Arc<dyn Table>>,
    pub chunk_store: Arc<ChunkStore>,
    /// 128-bit value unique per service instance (spec §3/§4.9/§8-5).
    pub tables_state_id: u128,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl ServiceState {
    /// Runs the bootstrap sequence from spec §4.9: try `LoadLatest`, fall
    /// back to `LoadFallbackCheckpoint` if nothing was found, install the
    /// given tables, then mint a fresh `tables_state_id`.
    pub async fn initialize(
        tables: Vec<Arc<dyn Table>>,
        chunk_store: Arc<ChunkStore>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
    ) -> Result<Self> {
        let table_map: HashMap<String, Arc<dyn Table>> = tables
            .into_iter()
            .map(|table| (table.name().to_string(), table))
            .collect();

        if let Some(checkpointer) = &checkpointer {
            let loaded = checkpointer.load_latest(&chunk_store, &table_map).await?;
            if !loaded {
                checkpointer.load_fallback(&chunk_store, &table_map).await?;
            }
        }

        Ok(Self {
            tables: table_map,
            chunk_store,
            tables_state_id: generate_tables_state_id(),
            checkpointer,
        })
    }
}

fn generate_tables_state_id() -> u128 {
    let mut rng = rand::thread_rng();
    let hi = rng.next_u64();
    let lo = rng.next_u64();
    ((hi as u128) << 64) | lo as u128
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpointer::NullCheckpointer;
    use crate::table::InMemoryTable;

    #[tokio::test]
    async fn initialize_installs_tables_and_mints_unique_id() {
        let chunk_store = Arc::new(ChunkStore::new());
        let tables: Vec<Arc<dyn Table>> = vec![Arc::new(InMemoryTable::new("t", u64::MAX))];
        let state = ServiceState::initialize(tables, chunk_store.clone(), None)
            .await
            .unwrap();
        assert!(state.tables.contains_key("t"));

        let chunk_store2 = Arc::new(ChunkStore::new());
        let tables2: Vec<Arc<dyn Table>> = vec![Arc::new(InMemoryTable::new("t", u64::MAX))];
        let state2 = ServiceState::initialize(tables2, chunk_store2, None)
            .await
            .unwrap();
        assert_ne!(state.tables_state_id, state2.tables_state_id);
    }

    #[tokio::test]
    async fn initialize_falls_back_when_no_checkpoint_present() {
        let chunk_store = Arc::new(ChunkStore::new());
        let checkpointer = Arc::new(NullCheckpointer);
        let state = ServiceState::initialize(vec![], chunk_store, Some(checkpointer))
            .await
            .unwrap();
        assert!(state.tables.is_empty());
    }
}
