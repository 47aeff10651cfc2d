use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Core(#[from] segment_core::error::CoreError),

    #[error("rpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("unknown workload: {0}")]
    UnknownWorkload(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
