//! Agent-local error type. Wraps [`segment_core::error::CoreError`] for the
//! taxonomy shared with the Controller (spec §7) and adds the handful of
//! variants that only make sense on this side (netlink/process plumbing).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] segment_core::error::CoreError),

    #[error("netlink request failed: {0}")]
    Netlink(String),

    #[error("tc command failed: {0}")]
    Tc(String),

    #[error("container runtime client error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("controller rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("controller transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("data-plane io error: {0}")]
    DataPlaneIo(#[from] std::io::Error),

    #[error("data-plane message too large: {0} bytes")]
    DataPlaneMessageTooLarge(usize),

    #[error("io error: {0}")]
    Io(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Core(e) => e.is_retryable(),
            AgentError::Runtime(_) | AgentError::Rpc(_) | AgentError::Transport(_) | AgentError::DataPlaneIo(_) => {
                true
            }
            _ => false,
        }
    }
}
