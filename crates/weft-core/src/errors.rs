/// Runtime error taxonomy shared across the workspace. `retryable()` is the
/// single source of truth for what callers may safely retry.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    /// Infrastructure hiccup (storage, channel closed mid-flight). Retryable.
    #[error("transient infrastructure error: {0}")]
    Transient(String),

    /// Session queue is at capacity. Retryable after backoff.
    #[error("session {0} is busy: queue full")]
    Busy(String),

    /// The agent runner itself failed. A failed turn never persists state,
    /// so retrying with the same input is safe.
    #[error("agent runner failed: {0}")]
    Adapter(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown orchestration: {0}")]
    UnknownOrchestration(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WeftError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Busy(_) | Self::Adapter(_))
    }
}
