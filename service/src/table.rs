//! The `Table` collaborator named throughout spec §3/§4/§6: a named
//! prioritized collection of items with a sampling distribution and a
//! rate-limiter. Production systems plug in their own sampler; this module
//! defines the trait the service layer drives and ships `InMemoryTable`, a
//! reference implementation good enough to exercise every testable property
//! in spec §8. The sampling distribution itself is explicitly out of scope
//! (spec §1), so `InMemoryTable`'s weighted-without-replacement draw is not a
//! claim about production sampler behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;

use replay_common::error::{ReplayError, Result};

use crate::chunk_store::Chunk;

/// A resolved slice of one chunk, as referenced by an item's flat trajectory.
#[derive(Debug, Clone)]
pub struct ChunkSliceRef {
    pub chunk: Arc<Chunk>,
    pub offset: i64,
    pub length: i64,
}

/// A keyed reference to an ordered sequence of chunk slices with a priority;
/// the unit of sampling (spec glossary).
#[derive(Debug)]
pub struct ItemRecord {
    pub item_key: u64,
    pub table: String,
    pub trajectory: Vec<ChunkSliceRef>,
    pub priority: Mutex<f64>,
    pub times_sampled: AtomicU64,
}

impl ItemRecord {
    pub fn priority(&self) -> f64 {
        *self.priority.lock()
    }
}

/// A priority update from `MutatePriorities`.
#[derive(Debug, Clone, Copy)]
pub struct PriorityUpdate {
    pub key: u64,
    pub priority: f64,
}

/// One draw from `sample_flexible_batch`: the item as it stood at sample
/// time, plus the bookkeeping fields the sample handler needs to frame a
/// response (spec §3, `SampledItem`).
#[derive(Debug, Clone)]
pub struct SampledItem {
    pub item: Arc<ItemRecord>,
    pub priority: f64,
    pub times_sampled: u64,
    pub probability: f64,
    pub table_size: u64,
    pub rate_limited: bool,
}

/// Snapshot returned by `Table::info()`.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub current_size: u64,
    pub max_size: u64,
}

/// The external collaborator named in spec §3/§4/§6. Object-safe so the
/// registry can hold `Arc<dyn Table>` per name.
#[async_trait::async_trait]
pub trait Table: Send + Sync {
    fn name(&self) -> &str;

    /// Inserts `item`, or replaces the existing item under the same key.
    fn insert_or_assign(&self, item: Arc<ItemRecord>) -> Result<()>;

    /// Applies priority updates and key deletions.
    fn mutate_items(&self, updates: Vec<PriorityUpdate>, delete_keys: Vec<u64>) -> Result<()>;

    /// Drops every item from the table.
    fn reset(&self) -> Result<()>;

    /// Draws up to `max` items, blocking on the rate-limiter for at most
    /// `timeout` (`None` means wait forever). A zero timeout on an empty
    /// table fails immediately with `DeadlineExceeded`.
    async fn sample_flexible_batch(
        &self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>>;

    fn default_flexible_batch_size(&self) -> usize;

    fn info(&self) -> TableInfo;

    fn debug_string(&self) -> String;

    fn close(&self);

    /// Every item currently in the table, in no particular order. Used only
    /// by the reference `Checkpointer` to build a snapshot; not part of the
    /// RPC-facing contract.
    fn export_items(&self) -> Vec<Arc<ItemRecord>>;
}

const DEFAULT_FLEXIBLE_BATCH_SIZE: usize = 64;

/// Reference `Table` implementation: a priority-weighted reservoir with a
/// rate-limiter modeled as "block until at least one item exists". Good
/// enough to drive the wire protocol; not a production sampler.
pub struct InMemoryTable {
    name: String,
    max_size: u64,
    items: Mutex<HashMap<u64, Arc<ItemRecord>>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl InMemoryTable {
    pub fn new(name: impl Into<String>, max_size: u64) -> Self {
        Self {
            name: name.into(),
            max_size,
            items: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn wait_for_items(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.items.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn draw_batch(&self, batch: usize) -> (Vec<SampledItem>, u64) {
        let items = self.items.lock();
        let table_size = items.len() as u64;
        let mut working: Vec<Arc<ItemRecord>> = items.values().cloned().collect();
        drop(items);

        let mut rng = rand::thread_rng();
        let mut out = Vec::with_capacity(batch.min(working.len()));
        for _ in 0..batch {
            if working.is_empty() {
                break;
            }
            let weights: Vec<f64> = working.iter().map(|i| i.priority()).collect();
            let total: f64 = weights.iter().sum();
            let idx = weighted_pick(&weights, total, &mut rng);
            let item = working.remove(idx);
            let probability = if total > 0.0 {
                weights[idx] / total
            } else {
                1.0 / weights.len() as f64
            };
            let times_sampled = item.times_sampled.fetch_add(1, Ordering::Relaxed) + 1;
            out.push(SampledItem {
                priority: item.priority(),
                times_sampled,
                probability,
                table_size,
                rate_limited: false,
                item,
            });
        }
        (out, table_size)
    }
}

fn weighted_pick(weights: &[f64], total: f64, rng: &mut impl Rng) -> usize {
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut threshold = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if threshold < *w {
            return i;
        }
        threshold -= *w;
    }
    weights.len() - 1
}

#[async_trait::async_trait]
impl Table for InMemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert_or_assign(&self, item: Arc<ItemRecord>) -> Result<()> {
        self.items.lock().insert(item.item_key, item);
        self.notify.notify_waiters();
        Ok(())
    }

    fn mutate_items(&self, updates: Vec<PriorityUpdate>, delete_keys: Vec<u64>) -> Result<()> {
        let mut items = self.items.lock();
        for update in updates {
            if let Some(item) = items.get(&update.key) {
                *item.priority.lock() = update.priority;
            }
        }
        for key in delete_keys {
            items.remove(&key);
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.items.lock().clear();
        Ok(())
    }

    async fn sample_flexible_batch(
        &self,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>> {
        let mut rate_limited = false;
        if self.items.lock().is_empty() {
            rate_limited = true;
            match timeout {
                Some(duration) => tokio::time::timeout(duration, self.wait_for_items())
                    .await
                    .map_err(|_| ReplayError::DeadlineExceeded)?,
                None => self.wait_for_items().await,
            }
        }

        let (mut samples, _) = self.draw_batch(max);
        if rate_limited {
            for sample in &mut samples {
                sample.rate_limited = true;
            }
        }
        Ok(samples)
    }

    fn default_flexible_batch_size(&self) -> usize {
        DEFAULT_FLEXIBLE_BATCH_SIZE
    }

    fn info(&self) -> TableInfo {
        TableInfo {
            name: self.name.clone(),
            current_size: self.items.lock().len() as u64,
            max_size: self.max_size,
        }
    }

    fn debug_string(&self) -> String {
        format!(
            "InMemoryTable{{name={}, size={}, max_size={}}}",
            self.name,
            self.items.lock().len(),
            self.max_size
        )
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn export_items(&self) -> Vec<Arc<ItemRecord>> {
        self.items.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn item(key: u64, priority: f64) -> Arc<ItemRecord> {
        Arc::new(ItemRecord {
            item_key: key,
            table: "t".to_string(),
            trajectory: vec![ChunkSliceRef {
                chunk: Arc::new(Chunk {
                    chunk_key: key,
                    data: Bytes::from_static(b"x"),
                }),
                offset: 0,
                length: 1,
            }],
            priority: Mutex::new(priority),
            times_sampled: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn insert_and_sample() {
        let table = InMemoryTable::new("t", u64::MAX);
        table.insert_or_assign(item(1, 1.0)).unwrap();
        let samples = table
            .sample_flexible_batch(1, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].item.item_key, 1);
        assert_eq!(samples[0].times_sampled, 1);
        assert!(!samples[0].rate_limited);
    }

    #[tokio::test]
    async fn zero_timeout_on_empty_table_times_out() {
        let table = InMemoryTable::new("t", u64::MAX);
        let err = table
            .sample_flexible_batch(1, Some(Duration::from_millis(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn blocks_until_insert_then_reports_rate_limited() {
        let table = Arc::new(InMemoryTable::new("t", u64::MAX));
        let inserter = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            inserter.insert_or_assign(item(5, 2.0)).unwrap();
        });
        let samples = table.sample_flexible_batch(1, None).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].rate_limited);
    }

    #[tokio::test]
    async fn mutate_and_reset() {
        let table = InMemoryTable::new("t", u64::MAX);
        table.insert_or_assign(item(1, 1.0)).unwrap();
        table.insert_or_assign(item(2, 1.0)).unwrap();
        table
            .mutate_items(
                vec![PriorityUpdate {
                    key: 1,
                    priority: 9.0,
                }],
                vec![2],
            )
            .unwrap();
        assert_eq!(table.export_items().len(), 1);
        assert_eq!(table.export_items()[0].priority(), 9.0);
        table.reset().unwrap();
        assert_eq!(table.export_items().len(), 0);
    }
}
