use thiserror::Error;

/// Error taxonomy shared by both tiers. Each variant documents its
/// propagation policy (spec §7): `Transient` variants are retried with
/// exponential backoff bounded at 30s by the caller; `Fatal`/`*Leaked`
/// variants require the caller to mark the affected resource degraded and
/// stop targeting it until manual reset.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("network namespace operation failed: {0}")]
    NamespaceError(String),

    /// Interception failed and rollback to the pre-intercept state succeeded.
    #[error("interception failed on container {container_id}: {reason}")]
    InterceptionFailed {
        container_id: String,
        reason: String,
    },

    /// Interception failed and rollback itself failed; the container must be
    /// marked degraded and left alone until a human intervenes.
    #[error("interception leaked on container {container_id}: {reason}")]
    InterceptionLeaked {
        container_id: String,
        reason: String,
    },

    #[error("data-plane socket unavailable: {0}")]
    DataPlaneUnavailable(String),

    #[error("policy compile error: {0}")]
    PolicyCompileError(String),

    #[error("controller unavailable: {0}")]
    ControllerUnavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Retry-eligible; callers back off exponentially up to 30s.
    #[error("transient error: {0}")]
    Transient(String),

    /// Requires human intervention; not retried.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether the propagation policy for this variant is "retry with
    /// backoff", per spec §7.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_)
                | CoreError::DataPlaneUnavailable(_)
                | CoreError::ControllerUnavailable(_)
                | CoreError::RuntimeUnavailable(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
