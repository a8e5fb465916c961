//! `InitializeConnection` (spec §4.10): the in-process fast-path handshake
//! that lets a co-located client acquire a shared reference to a table by
//! address, bypassing serialization. A deliberate trust-boundary violation
//! for same-host, same-process clients only (spec §9).

use std::sync::Arc;

use futures::Stream;
use replay_proto::replay as pb;
use replay_proto::replay::initialize_connection_request::Payload;
use tokio::sync::mpsc;
use tonic::Status;

use replay_common::error::ReplayError;

use crate::registry::ServiceState;
use crate::table::Table;

/// Drives one InitializeConnection stream. `peer_is_local` and `current_pid`
/// are resolved by the caller from transport-level peer information, since
/// this module has no transport dependency of its own beyond the generated
/// message types.
pub async fn run_initialize_connection(
    state: Arc<ServiceState>,
    peer_is_local: bool,
    current_pid: i64,
    mut request_stream: impl Stream<Item = Result<pb::InitializeConnectionRequest, Status>>
        + Unpin
        + Send
        + 'static,
    responses: mpsc::Sender<Result<pb::InitializeConnectionResponse, Status>>,
) {
    use futures::StreamExt;

    // Open Question 1 (spec §9): a non-local peer gets OK with no response
    // at all; the client is expected to read that as "fast path declined".
    if !peer_is_local {
        return;
    }

    let handshake = match request_stream.next().await {
        Some(Ok(pb::InitializeConnectionRequest {
            payload: Some(Payload::Handshake(h)),
        })) => h,
        Some(Ok(_)) => {
            let _ = responses
                .send(Err(Status::internal(
                    "expected a handshake as the first InitializeConnection message",
                )))
                .await;
            return;
        }
        Some(Err(status)) => {
            let _ = responses.send(Err(status)).await;
            return;
        }
        None => return,
    };

    if handshake.pid != current_pid {
        let _ = responses
            .send(Ok(pb::InitializeConnectionResponse { address: 0 }))
            .await;
        return;
    }

    let table = match state.tables.get(&handshake.table_name) {
        Some(table) => table.clone(),
        None => {
            let _ = responses
                .send(Err(Status::from(ReplayError::TableNotFound(
                    handshake.table_name.clone(),
                ))))
                .await;
            return;
        }
    };

    // Heap-owned holder so any exit path before the client's confirmation
    // can reclaim it (spec §4.10/§9). `address` is the holder's location,
    // handed to the client as a plain integer.
    let holder: Box<Arc<dyn Table>> = Box::new(table);
    let address = Box::into_raw(holder) as u64;

    if responses
        .send(Ok(pb::InitializeConnectionResponse { address }))
        .await
        .is_err()
    {
        reclaim(address);
        return;
    }

    match request_stream.next().await {
        Some(Ok(pb::InitializeConnectionRequest {
            payload: Some(Payload::Confirmation(confirmation)),
        })) if confirmation.ownership_transferred => {
            // The client has materialized its own `Arc<dyn Table>` from
            // `address` and taken ownership of the holder; we must not
            // reclaim it here.
        }
        Some(Ok(_)) => {
            reclaim(address);
            let _ = responses
                .send(Err(Status::internal("unexpected InitializeConnection confirmation")))
                .await;
        }
        Some(Err(status)) => {
            reclaim(address);
            let _ = responses.send(Err(status)).await;
        }
        None => {
            reclaim(address);
        }
    }
}

fn reclaim(address: u64) {
    // SAFETY: `address` was produced by `Box::into_raw` above for a
    // `Box<Arc<dyn Table>>` and has not been reclaimed on any other path
    // (every caller of `reclaim` returns immediately afterward).
    unsafe {
        drop(Box::from_raw(address as *mut Arc<dyn Table>));
    }
}
