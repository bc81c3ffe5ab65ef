use crate::{
    error::StateStoreError,
    state::{
        FlowStateStore,
        models::{CdcFlowState, QRepFlowState},
    },
};
use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;

pub struct SledFlowStateStore {
    db: sled::Db,
}

impl SledFlowStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    #[inline]
    fn cdc_key(job_name: &str) -> String {
        format!("cdc:{job_name}")
    }

    #[inline]
    fn qrep_key(job_name: &str) -> String {
        format!("qrep:{job_name}")
    }
}

#[async_trait]
impl FlowStateStore for SledFlowStateStore {
    async fn save_cdc_state(&self, state: &CdcFlowState) -> Result<(), StateStoreError> {
        let key = Self::cdc_key(&state.flow_job_name);
        let new_bytes = bincode::serialize(state)?;

        // Check-then-set in one transaction: a restarted flow generation
        // must never overwrite a newer snapshot with an older one.
        let result = self
            .db
            .transaction::<_, _, StateStoreError>(|tx_db| {
                if let Some(existing_bytes) = tx_db.get(&key)? {
                    let existing: CdcFlowState = bincode::deserialize(&existing_bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

                    let stale = existing.iteration > state.iteration
                        || existing.last_offset > state.last_offset;
                    if stale {
                        // Intentionally skip the write, not an error.
                        return Ok(());
                    }
                }
                tx_db.insert(key.as_str(), new_bytes.as_slice())?;
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StateStoreError::Storage(e)),
        }
    }

    async fn load_cdc_state(
        &self,
        job_name: &str,
    ) -> Result<Option<CdcFlowState>, StateStoreError> {
        match self.db.get(Self::cdc_key(job_name))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_qrep_state(&self, state: &QRepFlowState) -> Result<(), StateStoreError> {
        let bytes = bincode::serialize(state)?;
        self.db.insert(Self::qrep_key(&state.flow_job_name), bytes)?;
        Ok(())
    }

    async fn load_qrep_state(
        &self,
        job_name: &str,
    ) -> Result<Option<QRepFlowState>, StateStoreError> {
        match self.db.get(Self::qrep_key(job_name))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_flow_state(&self, job_name: &str) -> Result<(), StateStoreError> {
        self.db.remove(Self::cdc_key(job_name))?;
        self.db.remove(Self::qrep_key(job_name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn state(job: &str, offset: u64, iteration: u64) -> CdcFlowState {
        CdcFlowState {
            flow_job_name: job.into(),
            last_offset: offset,
            sync_batch_id: 1,
            normalize_batch_id: 1,
            setup_complete: true,
            iteration,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn roundtrips_cdc_state() {
        let dir = tempdir().unwrap();
        let store = SledFlowStateStore::open(dir.path()).unwrap();

        store.save_cdc_state(&state("job", 100, 1)).await.unwrap();
        let loaded = store.load_cdc_state("job").await.unwrap().unwrap();
        assert_eq!(loaded.last_offset, 100);
        assert!(loaded.setup_complete);
    }

    #[tokio::test]
    async fn stale_generation_cannot_rewind_offset() {
        let dir = tempdir().unwrap();
        let store = SledFlowStateStore::open(dir.path()).unwrap();

        store.save_cdc_state(&state("job", 200, 5)).await.unwrap();
        // A lagging writer from an older generation tries to write less
        // progress; the snapshot must keep the newer state.
        store.save_cdc_state(&state("job", 150, 4)).await.unwrap();

        let loaded = store.load_cdc_state("job").await.unwrap().unwrap();
        assert_eq!(loaded.last_offset, 200);
        assert_eq!(loaded.iteration, 5);
    }

    #[tokio::test]
    async fn delete_clears_both_kinds() {
        let dir = tempdir().unwrap();
        let store = SledFlowStateStore::open(dir.path()).unwrap();

        store.save_cdc_state(&state("job", 1, 1)).await.unwrap();
        store
            .save_qrep_state(&crate::state::models::QRepFlowState::initial("job"))
            .await
            .unwrap();
        store.delete_flow_state("job").await.unwrap();

        assert!(store.load_cdc_state("job").await.unwrap().is_none());
        assert!(store.load_qrep_state("job").await.unwrap().is_none());
    }
}
