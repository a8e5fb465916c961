//! Generated client/server code for the replay-buffer RPC service.

pub mod replay {
    tonic::include_proto!("replay");
}
