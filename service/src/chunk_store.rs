//! Content-addressed, reference-counted store of immutable trajectory
//! chunks. See spec §4.1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use replay_common::error::{ReplayError, Result};

/// An immutable, compressed trajectory fragment. Identity is `chunk_key`.
#[derive(Debug)]
pub struct Chunk {
    pub chunk_key: u64,
    pub data: Bytes,
}

/// Deduplicating keyed store of chunks. Storage entries are held weakly: the
/// slot is reclaimed once the last `Arc<Chunk>` handed out for a key drops.
pub struct ChunkStore {
    slots: DashMap<u64, Weak<Chunk>>,
    closed: AtomicBool,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Inserts `chunk`, or returns the existing shared chunk if one is
    /// already live under the same key (the new payload is discarded).
    /// Fails with `ServiceClosed` once `close()` has been called.
    pub fn insert(&self, chunk: Chunk) -> Result<Arc<Chunk>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplayError::ServiceClosed);
        }
        match self.slots.entry(chunk.chunk_key) {
            Entry::Occupied(mut slot) => {
                if let Some(existing) = slot.get().upgrade() {
                    return Ok(existing);
                }
                let shared = Arc::new(chunk);
                slot.insert(Arc::downgrade(&shared));
                Ok(shared)
            }
            Entry::Vacant(slot) => {
                let shared = Arc::new(chunk);
                slot.insert(Arc::downgrade(&shared));
                Ok(shared)
            }
        }
    }

    /// Transitions the store to closed: further `insert` calls fail.
    /// Shared chunks already handed out remain valid until dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of chunks currently live (for diagnostics/tests only).
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|e| e.value().strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_on_key() {
        let store = ChunkStore::new();
        let a = store
            .insert(Chunk {
                chunk_key: 7,
                data: Bytes::from_static(b"A"),
            })
            .unwrap();
        let b = store
            .insert(Chunk {
                chunk_key: 7,
                data: Bytes::from_static(b"DIFFERENT"),
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.data, Bytes::from_static(b"A"));
    }

    #[test]
    fn reclaims_after_last_drop() {
        let store = ChunkStore::new();
        {
            let _a = store
                .insert(Chunk {
                    chunk_key: 1,
                    data: Bytes::from_static(b"x"),
                })
                .unwrap();
            assert_eq!(store.live_count(), 1);
        }
        assert_eq!(store.live_count(), 0);
        let c = store
            .insert(Chunk {
                chunk_key: 1,
                data: Bytes::from_static(b"y"),
            })
            .unwrap();
        assert_eq!(c.data, Bytes::from_static(b"y"));
    }

    #[test]
    fn insert_after_close_fails() {
        let store = ChunkStore::new();
        store.close();
        let err = store
            .insert(Chunk {
                chunk_key: 1,
                data: Bytes::from_static(b"x"),
            })
            .unwrap_err();
        assert!(matches!(err, ReplayError::ServiceClosed));
    }
}
