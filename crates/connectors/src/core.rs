use crate::error::ConnectorError;
use async_trait::async_trait;
use model::{
    core::value::Value,
    flow::QRepConfig,
    partition::QRepPartition,
    records::{
        batch::RecordBatch,
        record::Lsn,
        stream::{QRecordReceiver, QRecordSender},
    },
    schema::{TableSchema, TableSchemaDelta},
};
use std::{collections::HashMap, time::Duration};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SetupReplicationRequest {
    pub flow_job_name: String,
    pub slot_name: String,
    pub publication_name: String,
    /// False when the slot was configured as pre-existing and is adopted.
    pub create_slot: bool,
    /// False when the publication was configured as pre-existing.
    pub create_publication: bool,
    pub source_tables: Vec<String>,
    pub do_initial_copy: bool,
}

#[derive(Debug, Clone)]
pub struct SetupReplicationOutput {
    pub slot_name: String,
    /// Exported snapshot for the initial copy; `None` unless requested.
    pub snapshot_name: Option<String>,
    pub consistent_point: Lsn,
}

#[derive(Debug, Clone)]
pub struct PullRecordsRequest {
    pub flow_job_name: String,
    pub slot_name: String,
    pub publication_name: String,
    /// Last checkpoint the destination committed. 0 means never synced.
    pub last_offset: Lsn,
    pub max_batch_size: usize,
    /// Close a non-empty batch after this much quiet time.
    pub idle_timeout: Duration,
    /// source table identifier → destination table identifier
    pub table_name_mapping: HashMap<String, String>,
    /// destination table identifier → declared schema, for drift detection
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
}

#[derive(Debug, Clone)]
pub struct PullFlowCleanupRequest {
    pub flow_job_name: String,
    pub slot_name: String,
    pub publication_name: String,
    pub drop_slot: bool,
    pub drop_publication: bool,
}

#[derive(Debug, Clone)]
pub struct SyncRecordsRequest {
    pub flow_job_name: String,
    pub batch: RecordBatch,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
    pub first_synced_checkpoint: Lsn,
    pub last_synced_checkpoint: Lsn,
    pub num_records_synced: u64,
    pub current_sync_batch_id: i64,
    pub table_name_rows_mapping: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct NormalizeRecordsRequest {
    pub flow_job_name: String,
    pub soft_delete: bool,
    /// destination table identifier → schema
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeResponse {
    pub done: bool,
    pub start_batch_id: i64,
    pub end_batch_id: i64,
}

/// CDC side of a source peer.
#[async_trait]
pub trait CdcPullConnector: Send + Sync {
    async fn check_connection(&self) -> Result<(), ConnectorError>;

    /// Verifies every mapped source table exists and is a plain table the
    /// publication can cover.
    async fn ensure_pullability(&self, tables: &[String]) -> Result<(), ConnectorError>;

    async fn setup_replication(
        &self,
        req: &SetupReplicationRequest,
    ) -> Result<SetupReplicationOutput, ConnectorError>;

    /// Pulls the next commit-closed batch after `last_offset`. Never blocks
    /// past the idle timeout once at least one record is buffered.
    async fn pull_records(&self, req: &PullRecordsRequest)
    -> Result<RecordBatch, ConnectorError>;

    /// Flush feedback: releases WAL up to `offset` once the destination has
    /// durably committed it.
    async fn confirm_flushed_offset(
        &self,
        slot_name: &str,
        offset: Lsn,
    ) -> Result<(), ConnectorError>;

    /// No-op WAL write that keeps an idle slot from pinning WAL.
    async fn send_wal_heartbeat(&self) -> Result<(), ConnectorError>;

    async fn pull_flow_cleanup(
        &self,
        req: &PullFlowCleanupRequest,
    ) -> Result<(), ConnectorError>;
}

/// Query-replication side of a source peer.
#[async_trait]
pub trait QRepPullConnector: Send + Sync {
    /// Partitions the watermark interval `(last_seen_max, current_max]`.
    /// Empty when there is nothing new.
    async fn get_qrep_partitions(
        &self,
        config: &QRepConfig,
        last: Option<&QRepPartition>,
    ) -> Result<Vec<QRepPartition>, ConnectorError>;

    /// Streams one partition's rows into `sender`; returns the row count.
    async fn pull_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        sender: QRecordSender,
    ) -> Result<u64, ConnectorError>;

    /// Current watermark maximum, for the wait-until-new-rows poll.
    async fn fetch_max_watermark(
        &self,
        config: &QRepConfig,
    ) -> Result<Option<Value>, ConnectorError>;
}

/// CDC side of a destination peer.
#[async_trait]
pub trait CdcSyncConnector: Send + Sync {
    async fn check_connection(&self) -> Result<(), ConnectorError>;

    async fn needs_setup_metadata_tables(&self) -> Result<bool, ConnectorError>;
    async fn setup_metadata_tables(&self) -> Result<(), ConnectorError>;

    async fn create_raw_table(&self, flow_job_name: &str) -> Result<(), ConnectorError>;
    async fn setup_normalized_tables(
        &self,
        schemas: &HashMap<String, TableSchema>,
        soft_delete: bool,
    ) -> Result<(), ConnectorError>;

    async fn get_last_offset(&self, flow_job_name: &str) -> Result<Lsn, ConnectorError>;
    async fn get_last_sync_batch_id(&self, flow_job_name: &str) -> Result<i64, ConnectorError>;
    async fn get_last_normalize_batch_id(&self, flow_job_name: &str)
    -> Result<i64, ConnectorError>;

    async fn sync_records(&self, req: &SyncRecordsRequest) -> Result<SyncResponse, ConnectorError>;
    async fn normalize_records(
        &self,
        req: &NormalizeRecordsRequest,
    ) -> Result<NormalizeResponse, ConnectorError>;

    async fn replay_table_schema_deltas(
        &self,
        flow_job_name: &str,
        deltas: &[TableSchemaDelta],
    ) -> Result<(), ConnectorError>;

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> Result<(), ConnectorError>;
}

/// Query-replication side of a destination peer.
#[async_trait]
pub trait QRepSyncConnector: Send + Sync {
    async fn setup_qrep_metadata_tables(&self, config: &QRepConfig)
    -> Result<(), ConnectorError>;

    /// True when a sentinel row shows this partition already landed; lets
    /// restarts skip completed partitions.
    async fn is_qrep_partition_synced(
        &self,
        config: &QRepConfig,
        partition_id: Uuid,
    ) -> Result<bool, ConnectorError>;

    async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        receiver: QRecordReceiver,
    ) -> Result<u64, ConnectorError>;

    async fn consolidate_qrep_partitions(
        &self,
        config: &QRepConfig,
    ) -> Result<(), ConnectorError>;

    async fn qrep_flow_cleanup(&self, flow_job_name: &str) -> Result<(), ConnectorError>;
}
