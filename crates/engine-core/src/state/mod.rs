pub mod models;
pub mod sled_store;

use crate::error::StateStoreError;
use async_trait::async_trait;
use models::{CdcFlowState, QRepFlowState};

/// Durable snapshots of flow progress. A flow writes its state before
/// truncating its in-memory history and reloads it on restart, which is
/// what makes long-running flows resumable across process generations.
#[async_trait]
pub trait FlowStateStore: Send + Sync {
    async fn save_cdc_state(&self, state: &CdcFlowState) -> Result<(), StateStoreError>;
    async fn load_cdc_state(&self, job_name: &str)
    -> Result<Option<CdcFlowState>, StateStoreError>;

    async fn save_qrep_state(&self, state: &QRepFlowState) -> Result<(), StateStoreError>;
    async fn load_qrep_state(
        &self,
        job_name: &str,
    ) -> Result<Option<QRepFlowState>, StateStoreError>;

    /// Removes every snapshot for a job; called when a flow is dropped.
    async fn delete_flow_state(&self, job_name: &str) -> Result<(), StateStoreError>;
}
