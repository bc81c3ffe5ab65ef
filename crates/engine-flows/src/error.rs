use engine_core::error::{ActivityError, StateStoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("activity failed: {0}")]
    Activity(#[from] ActivityError),

    #[error("flow state store: {0}")]
    State(#[from] StateStoreError),

    /// Operator asked the flow to stop; progress has been persisted.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl FlowError {
    /// Whether the flow ended because it was told to, rather than failing.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            FlowError::ShutdownRequested | FlowError::Activity(ActivityError::Cancelled)
        )
    }
}
