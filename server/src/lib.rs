//! Bootstrap for the replay-buffer RPC server: CLI parsing, config
//! loading, logging setup, and `tonic::transport::Server` wiring. None of
//! this is part of the service layer's contract (spec §1); the service
//! crate is fully testable without it.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use replay_common::config::ReplayServerConfig;
use replay_common::error::ReplayError;
use replay_proto::replay::replay_service_server::ReplayServiceServer;
use replay_service::checkpointer::{Checkpointer, MemCheckpointer, NullCheckpointer};
use replay_service::chunk_store::ChunkStore;
use replay_service::registry::ServiceState;
use replay_service::table::{InMemoryTable, Table};
use replay_service::ReplayServiceImpl;

/// Which `Checkpointer` backs the `Checkpoint` RPC. The on-disk/wire
/// checkpoint format is out of scope (spec §1), so the only non-trivial
/// backend this binary offers is the in-memory one already exercised by
/// `replay_service::checkpointer`'s own tests.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointBackend {
    /// No checkpointer: `Checkpoint` always fails, startup never restores.
    None,
    /// `MemCheckpointer`: round-trips through process memory only, lost on
    /// restart. Useful for exercising the Checkpoint/restore control flow
    /// without committing to a storage format.
    Memory,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "replay-server", about = "Prioritized experience-replay RPC server")]
pub struct ReplayServerOpts {
    /// Address to listen on for the ReplayService gRPC surface.
    #[arg(long, default_value = "0.0.0.0:50100")]
    pub listen_addr: String,

    /// TOML config file; unset uses built-in defaults and `--tables`.
    #[arg(long, default_value = "")]
    pub config_path: String,

    /// Table names to install at startup when no config file is given.
    #[arg(long, value_delimiter = ',', default_value = "default")]
    pub tables: Vec<String>,

    /// Checkpointer backend used for `Checkpoint` and startup restore.
    #[arg(long, value_enum, default_value = "none")]
    pub checkpoint_backend: CheckpointBackend,
}

fn load_config(opts: &ReplayServerOpts) -> Result<ReplayServerConfig, ReplayError> {
    if opts.config_path.is_empty() {
        Ok(ReplayServerConfig::default())
    } else {
        ReplayServerConfig::init(&opts.config_path)
    }
}

/// Bootstraps the replay server: builds the chunk store and tables, runs
/// the checkpoint-restore sequence (spec §4.9), and serves the
/// `ReplayService` gRPC surface until `shutdown_send` fires or Ctrl-C is
/// received.
pub async fn replay_server_serve(
    addr: SocketAddr,
    opts: ReplayServerOpts,
) -> Result<(JoinHandle<()>, UnboundedSender<()>), ReplayError> {
    let config = load_config(&opts)?;

    let table_names: Vec<String> = if config.tables.is_empty() {
        opts.tables.clone()
    } else {
        config.tables.iter().map(|t| t.name.clone()).collect()
    };
    let table_max_sizes: std::collections::HashMap<String, u64> = config
        .tables
        .iter()
        .map(|t| (t.name.clone(), t.max_size))
        .collect();

    let chunk_store = Arc::new(ChunkStore::new());
    let tables: Vec<Arc<dyn Table>> = table_names
        .into_iter()
        .map(|name| {
            let max_size = table_max_sizes.get(&name).copied().unwrap_or(u64::MAX);
            Arc::new(InMemoryTable::new(name, max_size)) as Arc<dyn Table>
        })
        .collect();

    let checkpointer: Arc<dyn Checkpointer> = match opts.checkpoint_backend {
        CheckpointBackend::None => Arc::new(NullCheckpointer),
        CheckpointBackend::Memory => Arc::new(MemCheckpointer::new()),
    };
    let state = Arc::new(
        ServiceState::initialize(tables, chunk_store.clone(), Some(checkpointer)).await?,
    );

    tracing::info!(
        %addr,
        tables_state_id = %state.tables_state_id,
        max_sample_response_bytes = config.server.max_sample_response_bytes,
        "starting replay server"
    );

    let service = ReplayServiceImpl::new(state, config.checkpoint.keep);
    let max_message_size = config.server.max_sample_response_bytes as usize;

    let (shutdown_send, mut shutdown_recv) = mpsc::unbounded_channel();
    let join_handle = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(
                ReplayServiceServer::new(service)
                    .max_decoding_message_size(max_message_size)
                    .max_encoding_message_size(max_message_size),
            )
            .serve_with_shutdown(addr, async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = shutdown_recv.recv() => {},
                }
            })
            .await
            .unwrap();
        // Spec §7: shutdown surfaces as Cancelled on any active InsertStream
        // once the ChunkStore refuses new inserts.
        chunk_store.close();
    });

    Ok((join_handle, shutdown_send))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_and_shuts_down() {
        let opts = ReplayServerOpts {
            listen_addr: "127.0.0.1:0".to_string(),
            config_path: String::new(),
            tables: vec!["t".to_string()],
            checkpoint_backend: CheckpointBackend::None,
        };
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (join, shutdown) = replay_server_serve(addr, opts).await.unwrap();
        shutdown.send(()).unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn server_with_memory_checkpoint_backend_starts() {
        let opts = ReplayServerOpts {
            listen_addr: "127.0.0.1:0".to_string(),
            config_path: String::new(),
            tables: vec!["t".to_string()],
            checkpoint_backend: CheckpointBackend::Memory,
        };
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (join, shutdown) = replay_server_serve(addr, opts).await.unwrap();
        shutdown.send(()).unwrap();
        join.await.unwrap();
    }
}
