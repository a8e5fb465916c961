//! The InsertStream handler (spec §4.3): bidirectional streaming ingest of
//! chunks and items, with read-ahead decoupling and per-stream chunk
//! retention.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use replay_proto::replay as pb;
use tokio::sync::mpsc;
use tonic::Status;

use replay_common::error::{ReplayError, Result};

use crate::chunk_store::Chunk;
use crate::queue::spawn_read_ahead;
use crate::registry::ServiceState;
use crate::table::{ChunkSliceRef, ItemRecord};

/// Drives one InsertStream from end to end: spawns the read-ahead reader,
/// processes requests in arrival order, and writes confirmations. Returns
/// when the wire closes (OK) or a fatal error terminates the stream.
///
/// `request_stream` is generic over any `Stream` of wire requests (not
/// pinned to `tonic::Streaming`) so this driver can be exercised with a
/// plain `futures::stream::iter` in tests.
pub async fn run_insert_stream(
    state: Arc<ServiceState>,
    request_stream: impl Stream<Item = Result<pb::InsertStreamRequest, Status>> + Unpin + Send + 'static,
    responses: mpsc::Sender<Result<pb::InsertStreamResponse, Status>>,
) {
    let (reader, mut rx) = spawn_read_ahead(request_stream);
    let mut pending_chunks: HashMap<u64, Arc<Chunk>> = HashMap::new();

    while let Some(item) = rx.recv().await {
        let request = match item {
            Ok(request) => request,
            Err(status) => {
                let _ = responses.send(Err(status)).await;
                break;
            }
        };
        if let Err(err) = process_request(&state, &mut pending_chunks, request, &responses).await
        {
            let _ = responses.send(Err(err.into())).await;
            break;
        }
    }

    // Dropping `rx` closes the read-ahead channel so the reader task's next
    // send fails and it exits, regardless of which path above we took.
    drop(rx);
    let _ = reader.await;
}

async fn process_request(
    state: &ServiceState,
    pending_chunks: &mut HashMap<u64, Arc<Chunk>>,
    request: pb::InsertStreamRequest,
    responses: &mpsc::Sender<Result<pb::InsertStreamResponse, Status>>,
) -> Result<()> {
    for chunk in request.chunks {
        let shared = state.chunk_store.insert(Chunk {
            chunk_key: chunk.chunk_key,
            data: chunk.data,
        })?;
        pending_chunks.insert(shared.chunk_key, shared);
    }

    let Some(item_insert) = request.item else {
        return Ok(());
    };

    let item_pb = item_insert
        .item
        .ok_or_else(|| ReplayError::Internal("ItemInsert missing item field".to_string()))?;

    let slices = item_pb
        .flat_trajectory
        .map(|t| t.chunk_slices)
        .unwrap_or_default();
    let mut trajectory = Vec::with_capacity(slices.len());
    for slice in slices {
        let chunk = pending_chunks
            .get(&slice.chunk_key)
            .cloned()
            .ok_or(ReplayError::ChunkNotFound(slice.chunk_key))?;
        trajectory.push(ChunkSliceRef {
            chunk,
            offset: slice.offset,
            length: slice.length,
        });
    }

    let table = state
        .tables
        .get(&item_pb.table)
        .cloned()
        .ok_or_else(|| ReplayError::TableNotFound(item_pb.table.clone()))?;

    let item_key = item_pb.item_key;
    let record = Arc::new(ItemRecord {
        item_key,
        table: item_pb.table,
        trajectory,
        priority: Mutex::new(item_pb.priority),
        times_sampled: std::sync::atomic::AtomicU64::new(item_pb.times_sampled),
    });
    table.insert_or_assign(record)?;

    if item_insert.send_confirmation
        && responses
            .send(Ok(pb::InsertStreamResponse { item_key }))
            .await
            .is_err()
    {
        return Err(ReplayError::Internal(
            "Failed to write to Insert stream.".to_string(),
        ));
    }

    let keep: HashSet<u64> = item_insert.keep_chunk_keys.into_iter().collect();
    pending_chunks.retain(|key, _| keep.contains(key));
    if pending_chunks.len() != keep.len() {
        // Caller contract violation (spec §4.3 step 6 / §7): the client
        // asked to keep chunk keys that were never buffered on this
        // stream. Demoted to a returned error rather than an abort, per
        // spec §9 Open Question 2.
        return Err(ReplayError::Internal(format!(
            "retention contract violation: expected {} kept chunks, found {}",
            keep.len(),
            pending_chunks.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpointer::NullCheckpointer;
    use crate::chunk_store::ChunkStore;
    use crate::table::{InMemoryTable, Table};
    use bytes::Bytes;
    use futures::stream;

    async fn build_state(table_name: &str) -> Arc<ServiceState> {
        let chunk_store = Arc::new(ChunkStore::new());
        let tables: Vec<Arc<dyn Table>> = vec![Arc::new(InMemoryTable::new(table_name, u64::MAX))];
        Arc::new(
            ServiceState::initialize(tables, chunk_store, Some(Arc::new(NullCheckpointer)))
                .await
                .unwrap(),
        )
    }

    fn insert_chunk(key: u64, data: &'static [u8]) -> pb::InsertStreamRequest {
        pb::InsertStreamRequest {
            chunks: vec![pb::Chunk {
                chunk_key: key,
                data: Bytes::from_static(data),
            }],
            item: None,
        }
    }

    fn insert_item(
        item_key: u64,
        table: &str,
        chunk_keys: &[u64],
        keep_chunk_keys: Vec<u64>,
        send_confirmation: bool,
    ) -> pb::InsertStreamRequest {
        pb::InsertStreamRequest {
            chunks: vec![],
            item: Some(pb::ItemInsert {
                item: Some(pb::Item {
                    item_key,
                    table: table.to_string(),
                    flat_trajectory: Some(pb::FlatTrajectory {
                        chunk_slices: chunk_keys
                            .iter()
                            .map(|&k| pb::ChunkSlice {
                                chunk_key: k,
                                offset: 0,
                                length: 1,
                            })
                            .collect(),
                    }),
                    priority: 1.0,
                    times_sampled: 0,
                }),
                send_confirmation,
                keep_chunk_keys,
            }),
        }
    }

    #[tokio::test]
    async fn scenario_s1_insert_round_trip() {
        let state = build_state("t").await;
        let requests = vec![
            Ok(insert_chunk(7, b"A")),
            Ok(insert_item(100, "t", &[7], vec![7], true)),
        ];

        let (tx, mut rx) = mpsc::channel(8);
        run_insert_stream(state, stream::iter(requests), tx).await;

        let confirmations: Vec<_> = {
            let mut out = vec![];
            while let Some(r) = rx.recv().await {
                out.push(r.unwrap());
            }
            out
        };
        assert_eq!(confirmations.len(), 1);
        assert_eq!(confirmations[0].item_key, 100);
    }

    #[tokio::test]
    async fn scenario_s2_missing_table() {
        let state = build_state("t").await;
        let mut pending = HashMap::new();
        pending.insert(
            7,
            Arc::new(Chunk {
                chunk_key: 7,
                data: Bytes::from_static(b"A"),
            }),
        );
        let (tx, _rx) = mpsc::channel(8);
        let err = process_request(
            &state,
            &mut pending,
            insert_item(1, "ghost", &[7], vec![7], false),
            &tx,
        )
        .await
        .unwrap_err();
        match err {
            ReplayError::TableNotFound(name) => assert_eq!(name, "ghost"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_s3_missing_chunk_reference() {
        let state = build_state("t").await;
        let mut pending = HashMap::new();
        let (tx, _rx) = mpsc::channel(8);
        let err = process_request(
            &state,
            &mut pending,
            insert_item(1, "t", &[999], vec![999], false),
            &tx,
        )
        .await
        .unwrap_err();
        match err {
            ReplayError::ChunkNotFound(key) => assert_eq!(key, 999),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_s4_retention_evicts_unkept_chunks() {
        let state = build_state("t").await;
        let mut pending = HashMap::new();
        let (tx, _rx) = mpsc::channel(8);

        for key in [1u64, 2, 3] {
            process_request(&state, &mut pending, insert_chunk(key, b"x"), &tx)
                .await
                .unwrap();
        }
        process_request(
            &state,
            &mut pending,
            insert_item(10, "t", &[1], vec![1], false),
            &tx,
        )
        .await
        .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key(&1));

        let err = process_request(
            &state,
            &mut pending,
            insert_item(11, "t", &[2], vec![2], false),
            &tx,
        )
        .await
        .unwrap_err();
        match err {
            ReplayError::ChunkNotFound(key) => assert_eq!(key, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
