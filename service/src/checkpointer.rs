//! The `Checkpointer` collaborator named in spec §4.7/§4.9/§6: snapshot and
//! restore of chunks+tables. The wire/on-disk checkpoint format is
//! explicitly out of scope (spec §1); this module defines the trait the
//! service layer drives plus two reference implementations used in tests
//! and as the default for a server started without persistent storage.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use replay_common::error::{ReplayError, Result};

use crate::chunk_store::{Chunk, ChunkStore};
use crate::table::{ChunkSliceRef, ItemRecord, Table};

/// `LoadLatest`/`LoadFallbackCheckpoint` return `Ok(true)` when a checkpoint
/// was found and installed, `Ok(false)` for the "not found" case spec §4.9
/// treats as non-fatal, and `Err` for anything else (which aborts
/// initialization per spec §7).
#[async_trait::async_trait]
pub trait Checkpointer: Send + Sync {
    async fn load_latest(
        &self,
        chunk_store: &Arc<ChunkStore>,
        tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<bool>;

    async fn load_fallback(
        &self,
        chunk_store: &Arc<ChunkStore>,
        tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<bool>;

    /// Snapshots every table and returns a path/identifier for the saved
    /// checkpoint. `keep` bounds how many past checkpoints are retained.
    async fn save(&self, tables: &HashMap<String, Arc<dyn Table>>, keep: u32) -> Result<String>;

    fn debug_string(&self) -> String;
}

/// A checkpointer that never has anything to load and refuses to save.
/// Useful as a placeholder when a server is started without durable
/// storage but still wants `Checkpoint` to fail with a clear error instead
/// of being silently absent (see `ServiceState::checkpointer: Option<_>`
/// for the "no checkpointer configured at all" case).
pub struct NullCheckpointer;

#[async_trait::async_trait]
impl Checkpointer for NullCheckpointer {
    async fn load_latest(
        &self,
        _chunk_store: &Arc<ChunkStore>,
        _tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn load_fallback(
        &self,
        _chunk_store: &Arc<ChunkStore>,
        _tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<bool> {
        Ok(false)
    }

    async fn save(&self, _tables: &HashMap<String, Arc<dyn Table>>, _keep: u32) -> Result<String> {
        Err(ReplayError::Internal(
            "NullCheckpointer cannot save checkpoints".to_string(),
        ))
    }

    fn debug_string(&self) -> String {
        "NullCheckpointer".to_string()
    }
}

#[derive(Debug, Clone)]
struct ItemSnapshot {
    item_key: u64,
    priority: f64,
    times_sampled: u64,
    trajectory: Vec<(u64, i64, i64, Bytes)>,
}

#[derive(Debug, Clone, Default)]
struct CheckpointSnapshot {
    tables: HashMap<String, Vec<ItemSnapshot>>,
}

/// An in-memory checkpointer that round-trips through a `Mutex<Vec<_>>` of
/// retained snapshots. Exercises the same `Save`/`Load*` control flow a real
/// on-disk checkpointer would, without committing this crate to a specific
/// serialization format (spec §1 names that out of scope).
pub struct MemCheckpointer {
    snapshots: Mutex<Vec<CheckpointSnapshot>>,
}

impl Default for MemCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCheckpointer {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(Vec::new()),
        }
    }

    fn install(
        snapshot: &CheckpointSnapshot,
        chunk_store: &Arc<ChunkStore>,
        tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<()> {
        for (name, items) in &snapshot.tables {
            let Some(table) = tables.get(name) else {
                continue;
            };
            for item in items {
                let mut trajectory = Vec::with_capacity(item.trajectory.len());
                for (chunk_key, offset, length, data) in &item.trajectory {
                    let chunk = chunk_store.insert(Chunk {
                        chunk_key: *chunk_key,
                        data: data.clone(),
                    })?;
                    trajectory.push(ChunkSliceRef {
                        chunk,
                        offset: *offset,
                        length: *length,
                    });
                }
                let record = Arc::new(ItemRecord {
                    item_key: item.item_key,
                    table: name.clone(),
                    trajectory,
                    priority: parking_lot::Mutex::new(item.priority),
                    times_sampled: std::sync::atomic::AtomicU64::new(item.times_sampled),
                });
                table.insert_or_assign(record)?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Checkpointer for MemCheckpointer {
    async fn load_latest(
        &self,
        chunk_store: &Arc<ChunkStore>,
        tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<bool> {
        let latest = self.snapshots.lock().last().cloned();
        match latest {
            Some(snapshot) => {
                Self::install(&snapshot, chunk_store, tables)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_fallback(
        &self,
        chunk_store: &Arc<ChunkStore>,
        tables: &HashMap<String, Arc<dyn Table>>,
    ) -> Result<bool> {
        let fallback = self.snapshots.lock().first().cloned();
        match fallback {
            Some(snapshot) => {
                Self::install(&snapshot, chunk_store, tables)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save(&self, tables: &HashMap<String, Arc<dyn Table>>, keep: u32) -> Result<String> {
        let mut snapshot = CheckpointSnapshot::default();
        for (name, table) in tables {
            let items = table
                .export_items()
                .into_iter()
                .map(|item| ItemSnapshot {
                    item_key: item.item_key,
                    priority: item.priority(),
                    times_sampled: item.times_sampled.load(std::sync::atomic::Ordering::Relaxed),
                    trajectory: item
                        .trajectory
                        .iter()
                        .map(|s| (s.chunk.chunk_key, s.offset, s.length, s.chunk.data.clone()))
                        .collect(),
                })
                .collect();
            snapshot.tables.insert(name.clone(), items);
        }

        let mut snapshots = self.snapshots.lock();
        snapshots.push(snapshot);
        let keep = keep.max(1) as usize;
        let drop_count = snapshots.len().saturating_sub(keep);
        if drop_count > 0 {
            snapshots.drain(0..drop_count);
        }
        Ok(format!("mem://checkpoint-{}", snapshots.len()))
    }

    fn debug_string(&self) -> String {
        format!("MemCheckpointer{{snapshots={}}}", self.snapshots.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::InMemoryTable;

    #[tokio::test]
    async fn null_checkpointer_reports_not_found_and_refuses_save() {
        let checkpointer = NullCheckpointer;
        let chunk_store = Arc::new(ChunkStore::new());
        let tables: HashMap<String, Arc<dyn Table>> = HashMap::new();
        assert!(!checkpointer.load_latest(&chunk_store, &tables).await.unwrap());
        assert!(checkpointer.save(&tables, 1).await.is_err());
    }

    #[tokio::test]
    async fn mem_checkpointer_round_trips_items_and_chunks() {
        let checkpointer = MemCheckpointer::new();
        let chunk_store = Arc::new(ChunkStore::new());
        let table: Arc<dyn Table> = Arc::new(InMemoryTable::new("t", u64::MAX));
        let mut tables: HashMap<String, Arc<dyn Table>> = HashMap::new();
        tables.insert("t".to_string(), table.clone());

        let chunk = chunk_store
            .insert(Chunk {
                chunk_key: 7,
                data: Bytes::from_static(b"payload"),
            })
            .unwrap();
        let item = Arc::new(ItemRecord {
            item_key: 100,
            table: "t".to_string(),
            trajectory: vec![ChunkSliceRef {
                chunk,
                offset: 0,
                length: 7,
            }],
            priority: parking_lot::Mutex::new(1.0),
            times_sampled: std::sync::atomic::AtomicU64::new(0),
        });
        table.insert_or_assign(item).unwrap();

        let path = checkpointer.save(&tables, 1).await.unwrap();
        assert!(path.starts_with("mem://"));

        table.reset().unwrap();
        assert_eq!(table.export_items().len(), 0);

        let fresh_store = Arc::new(ChunkStore::new());
        assert!(checkpointer
            .load_latest(&fresh_store, &tables)
            .await
            .unwrap());
        let restored = table.export_items();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].item_key, 100);
        assert_eq!(restored[0].trajectory[0].chunk.data, Bytes::from_static(b"payload"));
    }
}
