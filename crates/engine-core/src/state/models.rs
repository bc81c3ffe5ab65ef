use chrono::{DateTime, Utc};
use model::{partition::QRepPartition, records::record::Lsn};
use serde::{Deserialize, Serialize};

/// Everything a CDC flow needs to resume after truncating its history:
/// the durable offset and batch ids as of the last committed step, plus
/// the setup marker so restarts skip straight to the pull loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CdcFlowState {
    pub flow_job_name: String,
    pub last_offset: Lsn,
    pub sync_batch_id: i64,
    pub normalize_batch_id: i64,
    pub setup_complete: bool,
    /// Generations survived; monotone, used to reject stale writers.
    pub iteration: u64,
    pub updated_at: DateTime<Utc>,
}

impl CdcFlowState {
    pub fn initial(flow_job_name: &str) -> Self {
        Self {
            flow_job_name: flow_job_name.to_string(),
            last_offset: 0,
            sync_batch_id: 0,
            normalize_batch_id: 0,
            setup_complete: false,
            iteration: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QRepFlowState {
    pub flow_job_name: String,
    /// Highest partition fully replicated; the next run resumes past it.
    pub last_partition: Option<QRepPartition>,
    pub num_partitions_processed: u64,
    pub updated_at: DateTime<Utc>,
}

impl QRepFlowState {
    pub fn initial(flow_job_name: &str) -> Self {
        Self {
            flow_job_name: flow_job_name.to_string(),
            last_partition: None,
            num_partitions_processed: 0,
            updated_at: Utc::now(),
        }
    }
}
