use crate::dtype::UnknownDType;
use crate::rpc::RpcError;
use crate::schedule::UnknownStrategy;
use crate::workload::UnknownWorkloadSet;

/// Failures that stop the program before the sweep starts.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    DType(#[from] UnknownDType),
    #[error(transparent)]
    WorkloadSet(#[from] UnknownWorkloadSet),
    #[error(transparent)]
    Strategy(#[from] UnknownStrategy),
    #[error("environment variable {0} must be set in remote mode")]
    MissingEnv(&'static str),
    #[error("environment variable {name} must be a port number, got '{value}'")]
    InvalidPort { name: &'static str, value: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
