//! Wires the wire protocol (`replay_proto::replay::replay_service_server`)
//! to the handlers in this crate. Spec §6's RPC surface maps 1:1 onto the
//! seven methods below; each streaming RPC hands its request stream and a
//! response channel off to a dedicated task so the socket stays responsive
//! while the handler does CPU-bound work (spec §5).

use std::net::SocketAddr;
use std::sync::Arc;

use replay_proto::replay as pb;
use replay_proto::replay::replay_service_server::ReplayService;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use replay_common::error::ReplayError;

use crate::handshake;
use crate::insert_stream;
use crate::registry::ServiceState;
use crate::sample_stream;
use crate::table::PriorityUpdate;

/// Response-channel capacity for streaming RPCs. Small and fixed: the
/// read-ahead queue (spec §4.2) already bounds how far ahead of the wire
/// an InsertStream runs, and SampleStream's cadence is paced by the
/// rate-limiter, so this is purely a buffer against transient write stalls.
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

pub struct ReplayServiceImpl {
    state: Arc<ServiceState>,
    /// Number of past checkpoints `Checkpoint` asks the checkpointer to
    /// retain (`common::config::CheckpointConfig::keep`).
    checkpoint_keep: u32,
}

impl ReplayServiceImpl {
    pub fn new(state: Arc<ServiceState>, checkpoint_keep: u32) -> Self {
        Self {
            state,
            checkpoint_keep,
        }
    }
}

fn is_local_addr(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

#[tonic::async_trait]
impl ReplayService for ReplayServiceImpl {
    type InsertStreamStream = ReceiverStream<Result<pb::InsertStreamResponse, Status>>;
    type SampleStreamStream = ReceiverStream<Result<pb::SampleStreamResponse, Status>>;
    type InitializeConnectionStream =
        ReceiverStream<Result<pb::InitializeConnectionResponse, Status>>;

    async fn checkpoint(
        &self,
        _request: Request<pb::CheckpointRequest>,
    ) -> Result<Response<pb::CheckpointResponse>, Status> {
        let checkpointer = self
            .state
            .checkpointer
            .as_ref()
            .ok_or(ReplayError::NoCheckpointer)?;
        let path = checkpointer
            .save(&self.state.tables, self.checkpoint_keep)
            .await
            .map_err(Status::from)?;
        tracing::info!(path = %path, "checkpoint saved");
        Ok(Response::new(pb::CheckpointResponse { path }))
    }

    async fn insert_stream(
        &self,
        request: Request<tonic::Streaming<pb::InsertStreamRequest>>,
    ) -> Result<Response<Self::InsertStreamStream>, Status> {
        let in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let state = self.state.clone();
        tokio::spawn(insert_stream::run_insert_stream(state, in_stream, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn mutate_priorities(
        &self,
        request: Request<pb::MutatePrioritiesRequest>,
    ) -> Result<Response<pb::MutatePrioritiesResponse>, Status> {
        let req = request.into_inner();
        let table = self
            .state
            .tables
            .get(&req.table)
            .cloned()
            .ok_or_else(|| ReplayError::TableNotFound(req.table.clone()))?;
        let updates = req
            .updates
            .into_iter()
            .map(|u| PriorityUpdate {
                key: u.key,
                priority: u.priority,
            })
            .collect();
        table.mutate_items(updates, req.delete_keys)?;
        Ok(Response::new(pb::MutatePrioritiesResponse {}))
    }

    async fn reset(
        &self,
        request: Request<pb::ResetRequest>,
    ) -> Result<Response<pb::ResetResponse>, Status> {
        let req = request.into_inner();
        let table = self
            .state
            .tables
            .get(&req.table)
            .cloned()
            .ok_or_else(|| ReplayError::TableNotFound(req.table.clone()))?;
        table.reset()?;
        Ok(Response::new(pb::ResetResponse {}))
    }

    async fn sample_stream(
        &self,
        request: Request<tonic::Streaming<pb::SampleStreamRequest>>,
    ) -> Result<Response<Self::SampleStreamStream>, Status> {
        let in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let state = self.state.clone();
        tokio::spawn(sample_stream::run_sample_stream(state, in_stream, tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn server_info(
        &self,
        _request: Request<pb::ServerInfoRequest>,
    ) -> Result<Response<pb::ServerInfoResponse>, Status> {
        let table_info = self
            .state
            .tables
            .values()
            .map(|table| {
                let info = table.info();
                pb::TableInfo {
                    name: info.name,
                    current_size: info.current_size,
                    max_size: info.max_size,
                    debug_string: table.debug_string(),
                }
            })
            .collect();
        Ok(Response::new(pb::ServerInfoResponse {
            table_info,
            tables_state_id_hi: (self.state.tables_state_id >> 64) as u64,
            tables_state_id_lo: self.state.tables_state_id as u64,
        }))
    }

    async fn initialize_connection(
        &self,
        request: Request<tonic::Streaming<pb::InitializeConnectionRequest>>,
    ) -> Result<Response<Self::InitializeConnectionStream>, Status> {
        let peer_is_local = request
            .remote_addr()
            .map(|addr| is_local_addr(&addr))
            .unwrap_or(false);
        let in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(4);
        let state = self.state.clone();
        let pid = std::process::id() as i64;
        tokio::spawn(handshake::run_initialize_connection(
            state,
            peer_is_local,
            pid,
            in_stream,
            tx,
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
