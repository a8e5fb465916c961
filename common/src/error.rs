use tonic::Status;

/// All failure modes the service layer can produce.
///
/// Each variant carries the context needed to reconstruct the
/// transport-mapped status without re-deriving it at the call site; the
/// mapping itself lives in the `From<ReplayError> for tonic::Status` impl
/// below, so RPC handlers just propagate with `?`.
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("Priority table {0} was not found")]
    TableNotFound(String),

    #[error("Could not find sequence chunk {0}.")]
    ChunkNotFound(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Service has been closed")]
    ServiceClosed,

    #[error("{0}")]
    Internal(String),

    #[error("rate limiter timed out waiting for an item")]
    DeadlineExceeded,

    #[error("no checkpointer is configured for this service")]
    NoCheckpointer,
}

pub type Result<T> = std::result::Result<T, ReplayError>;

impl From<ReplayError> for Status {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::TableNotFound(_) => Status::not_found(err.to_string()),
            ReplayError::ChunkNotFound(_) => Status::internal(err.to_string()),
            ReplayError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            ReplayError::ServiceClosed => Status::cancelled(err.to_string()),
            ReplayError::Internal(_) => Status::internal(err.to_string()),
            ReplayError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            ReplayError::NoCheckpointer => Status::invalid_argument(err.to_string()),
        }
    }
}
