//! Service layer of the replay-buffer RPC server: the ChunkStore,
//! InsertStream/SampleStream handlers, the table registry, and the
//! in-process handshake. See spec §1-§9 for the contract this crate
//! implements.

pub mod checkpointer;
pub mod chunk_store;
pub mod grpc;
pub mod handshake;
pub mod insert_stream;
pub mod queue;
pub mod registry;
pub mod sample_stream;
pub mod table;

pub use grpc::ReplayServiceImpl;
pub use registry::ServiceState;
