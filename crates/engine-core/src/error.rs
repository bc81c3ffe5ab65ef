use thiserror::Error;

/// How an activity failure should be handled by the runtime. The taxonomy
/// mirrors what connectors can report: retryable connectivity trouble,
/// precondition failures that need an operator, corrupt input that must not
/// advance the offset, and missing capabilities that degrade to no-ops.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// Connectivity or timeout trouble; the runtime retries with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The flow cannot proceed without operator intervention.
    #[error("operator intervention required: {0}")]
    Precondition(String),

    /// Undecodable input; fatal to the step, offset must not advance.
    #[error("data corruption: {0}")]
    Corrupt(String),

    /// Capability sentinel; callers treat the step as a no-op.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The activity was cancelled from outside.
    #[error("cancelled")]
    Cancelled,

    /// The activity went quiet past its heartbeat allowance and was
    /// rescheduled too many times.
    #[error("activity lost: {0}")]
    Lost(String),
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Transient(_) | ActivityError::Lost(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, ActivityError::Unsupported(_))
    }
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store unavailable: {0}")]
    Storage(#[from] sled::Error),

    #[error("state snapshot corrupted: {0}")]
    Codec(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_lost_retry() {
        assert!(ActivityError::Transient("net".into()).is_retryable());
        assert!(ActivityError::Lost("no beats".into()).is_retryable());
        assert!(!ActivityError::Corrupt("wal".into()).is_retryable());
        assert!(!ActivityError::Precondition("drift".into()).is_retryable());
        assert!(!ActivityError::Unsupported("normalize".into()).is_retryable());
    }
}
