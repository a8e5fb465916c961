//! The SampleStream handler (spec §4.5/§4.6): prioritized flexible-batch
//! sampling with a rate-limiter timeout, framed into response messages
//! bounded by `MAX_SAMPLE_RESPONSE_SIZE_BYTES` with zero-copy chunk
//! fan-out.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use replay_proto::replay as pb;
use tokio::sync::mpsc;
use tonic::Status;

use replay_common::error::ReplayError;

use crate::registry::ServiceState;
use crate::table::SampledItem;

/// `kMaxSampleResponseSizeBytes` (spec §4.6/§6).
pub const MAX_SAMPLE_RESPONSE_SIZE_BYTES: u64 = 40 * 1024 * 1024;

/// Sentinel matching the client sampler's "let the server pick" convention
/// for `flexible_batch_size` (spec §4.5/§6).
pub const AUTO_SELECT_FLEXIBLE_BATCH_SIZE: i64 = 0;

/// Drives one SampleStream: reads sample requests in a loop, emitting
/// framed responses for each, until the wire closes (OK) or a fatal error
/// terminates the stream.
pub async fn run_sample_stream(
    state: Arc<ServiceState>,
    mut request_stream: impl Stream<Item = Result<pb::SampleStreamRequest, Status>> + Unpin + Send + 'static,
    responses: mpsc::Sender<Result<pb::SampleStreamResponse, Status>>,
) {
    use futures::StreamExt;

    loop {
        let request = match request_stream.next().await {
            Some(Ok(request)) => request,
            Some(Err(status)) => {
                let _ = responses.send(Err(status)).await;
                return;
            }
            None => return, // EOF: OK.
        };

        if let Err(status) = handle_request(&state, request, &responses).await {
            let _ = responses.send(Err(status)).await;
            return;
        }
    }
}

async fn handle_request(
    state: &ServiceState,
    request: pb::SampleStreamRequest,
    responses: &mpsc::Sender<Result<pb::SampleStreamResponse, Status>>,
) -> Result<(), Status> {
    if request.num_samples <= 0 {
        return Err(Status::invalid_argument("num_samples must be > 0"));
    }
    if request.flexible_batch_size <= 0 && request.flexible_batch_size != AUTO_SELECT_FLEXIBLE_BATCH_SIZE
    {
        return Err(Status::invalid_argument(
            "flexible_batch_size must be > 0 or the AutoSelect sentinel",
        ));
    }

    let timeout = match request.rate_limiter_timeout_ms {
        Some(ms) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
        _ => None,
    };

    let table = state
        .tables
        .get(&request.table)
        .cloned()
        .ok_or_else(|| Status::from(ReplayError::TableNotFound(request.table.clone())))?;
    let default_batch = table.default_flexible_batch_size();

    let mut count: i64 = 0;
    while count < request.num_samples {
        // Cancellation check between batches (spec §4.5/§5): a closed
        // response channel means the client went away; exit without error.
        if responses.is_closed() {
            return Ok(());
        }

        let remaining = (request.num_samples - count) as usize;
        let batch = if request.flexible_batch_size == AUTO_SELECT_FLEXIBLE_BATCH_SIZE {
            default_batch
        } else {
            request.flexible_batch_size as usize
        }
        .min(remaining);

        let samples = table
            .sample_flexible_batch(batch, timeout)
            .await
            .map_err(Status::from)?;

        for sample in &samples {
            write_sample(sample, responses).await?;
        }
        count += samples.len() as i64;
    }

    Ok(())
}

/// Fans one sampled item's chunks out across one or more response frames,
/// each bounded by `MAX_SAMPLE_RESPONSE_SIZE_BYTES` (spec §4.6).
async fn write_sample(
    sample: &SampledItem,
    responses: &mpsc::Sender<Result<pb::SampleStreamResponse, Status>>,
) -> Result<(), Status> {
    let info = build_info(sample);
    let chunk_count = sample.item.trajectory.len();

    let mut entry = pb::SampleEntry {
        info: Some(info),
        chunks: Vec::new(),
        end_of_sequence: false,
    };
    let mut entry_bytes: u64 = 0;

    for (i, slice) in sample.item.trajectory.iter().enumerate() {
        // Zero-copy: `Bytes::clone()` bumps a refcount rather than copying
        // the chunk payload, so the same backing buffer is shared between
        // the `ChunkStore` entry and every frame that references it.
        let chunk = pb::Chunk {
            chunk_key: slice.chunk.chunk_key,
            data: slice.chunk.data.clone(),
        };
        let chunk_bytes = chunk.data.len() as u64;

        if !entry.chunks.is_empty() && entry_bytes + chunk_bytes > MAX_SAMPLE_RESPONSE_SIZE_BYTES {
            flush_entry(&mut entry, responses).await?;
            entry = pb::SampleEntry {
                info: None,
                chunks: Vec::new(),
                end_of_sequence: false,
            };
            entry_bytes = 0;
        }

        entry.chunks.push(chunk);
        entry_bytes += chunk_bytes;
        // Set per chunk as it's appended (spec §4.6) so a flush mid-sample
        // never leaves a stale `true` on an entry that isn't actually last.
        entry.end_of_sequence = i + 1 == chunk_count;
    }

    flush_entry(&mut entry, responses).await
}

async fn flush_entry(
    entry: &mut pb::SampleEntry,
    responses: &mpsc::Sender<Result<pb::SampleStreamResponse, Status>>,
) -> Result<(), Status> {
    let entry = std::mem::take(entry);
    let response = pb::SampleStreamResponse {
        entries: vec![entry],
    };
    responses
        .send(Ok(response))
        .await
        .map_err(|_| Status::internal("Failed to write to Sample stream."))
}

fn build_info(sample: &SampledItem) -> pb::SampledItemInfo {
    let item = pb::Item {
        item_key: sample.item.item_key,
        table: sample.item.table.clone(),
        flat_trajectory: Some(pb::FlatTrajectory {
            chunk_slices: sample
                .item
                .trajectory
                .iter()
                .map(|s| pb::ChunkSlice {
                    chunk_key: s.chunk.chunk_key,
                    offset: s.offset,
                    length: s.length,
                })
                .collect(),
        }),
        priority: sample.priority,
        times_sampled: sample.times_sampled,
    };
    pb::SampledItemInfo {
        item: Some(item),
        probability: sample.probability,
        table_size: sample.table_size,
        rate_limited: sample.rate_limited,
    }
}
