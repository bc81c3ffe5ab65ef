use crate::schema::{TableMapping, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Peer backends. Only Postgres sources and Snowflake destinations are
/// implemented; the rest exist so capability probing has something to say
/// no about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    Postgres,
    Snowflake,
    Bigquery,
    S3,
    Eventhub,
}

impl PeerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerType::Postgres => "postgres",
            PeerType::Snowflake => "snowflake",
            PeerType::Bigquery => "bigquery",
            PeerType::S3 => "s3",
            PeerType::Eventhub => "eventhub",
        }
    }
}

/// A configured endpoint. `options` is opaque here; the connector selected
/// by `kind` deserializes it into its own config type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub kind: PeerType,
    pub options: serde_json::Value,
}

/// How QRep rows land on the destination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    MultiInsert,
    StorageAvro,
}

fn default_max_batch_size() -> usize {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    10
}

fn default_snapshot_tables_in_parallel() -> usize {
    1
}

fn default_snapshot_max_parallel_workers() -> usize {
    4
}

fn default_sync_flow_loops() -> usize {
    40
}

/// Immutable per-job configuration for a CDC mirror. Owned by the flow for
/// its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConnectionConfigs {
    pub flow_job_name: String,
    pub source: Peer,
    pub destination: Peer,
    pub table_mappings: Vec<TableMapping>,
    /// destination table identifier → schema
    #[serde(default)]
    pub table_name_schema_mapping: HashMap<String, TableSchema>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// When set, the publication is adopted and never created or dropped.
    #[serde(default)]
    pub existing_publication_name: Option<String>,
    /// When set, the slot is adopted and never created or dropped.
    #[serde(default)]
    pub existing_replication_slot_name: Option<String>,
    #[serde(default)]
    pub do_initial_copy: bool,
    #[serde(default)]
    pub staging_path: Option<String>,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default = "default_snapshot_tables_in_parallel")]
    pub snapshot_num_tables_in_parallel: usize,
    #[serde(default = "default_snapshot_max_parallel_workers")]
    pub snapshot_max_parallel_workers: usize,
    /// Iterations of pull→sync→normalize before the flow truncates its
    /// history and restarts from a snapshot.
    #[serde(default = "default_sync_flow_loops")]
    pub sync_flow_loop_count: usize,
}

impl FlowConnectionConfigs {
    /// Publication name in effect: the adopted one or the job-derived one.
    pub fn publication_name(&self) -> String {
        self.existing_publication_name.clone().unwrap_or_else(|| {
            format!(
                "sluice_pub_{}",
                crate::core::identifiers::sanitize(&self.flow_job_name)
            )
        })
    }

    pub fn slot_name(&self) -> String {
        self.existing_replication_slot_name
            .clone()
            .unwrap_or_else(|| {
                format!(
                    "sluice_slot_{}",
                    crate::core::identifiers::sanitize(&self.flow_job_name)
                )
            })
    }

    pub fn owns_publication(&self) -> bool {
        self.existing_publication_name.is_none()
    }

    pub fn owns_slot(&self) -> bool {
        self.existing_replication_slot_name.is_none()
    }
}

fn default_num_rows_per_partition() -> u64 {
    100_000
}

fn default_max_parallel_workers() -> usize {
    4
}

fn default_batch_size_int() -> usize {
    1_000
}

fn default_wait_between_batches_secs() -> u64 {
    30
}

/// Configuration for one query-replication job (also used per-table by the
/// initial snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QRepConfig {
    pub flow_job_name: String,
    pub source: Peer,
    pub destination: Peer,
    /// Query with `{{.start}}` / `{{.end}}` placeholders for the partition
    /// bounds.
    pub query: String,
    pub watermark_table: String,
    pub watermark_column: String,
    pub destination_table_identifier: String,
    #[serde(default = "default_num_rows_per_partition")]
    pub num_rows_per_partition: u64,
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    #[serde(default = "default_batch_size_int")]
    pub batch_size_int: usize,
    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub staging_path: Option<String>,
    #[serde(default)]
    pub initial_copy_only: bool,
    #[serde(default = "default_wait_between_batches_secs")]
    pub wait_between_batches_secs: u64,
    /// Exported snapshot to read under, for snapshot-consistent pulls.
    #[serde(default)]
    pub snapshot_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(kind: PeerType) -> Peer {
        Peer {
            name: "p".into(),
            kind,
            options: serde_json::json!({}),
        }
    }

    fn configs(existing_slot: Option<&str>) -> FlowConnectionConfigs {
        FlowConnectionConfigs {
            flow_job_name: "orders-mirror".into(),
            source: peer(PeerType::Postgres),
            destination: peer(PeerType::Snowflake),
            table_mappings: vec![],
            table_name_schema_mapping: HashMap::new(),
            max_batch_size: default_max_batch_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sync_mode: SyncMode::default(),
            existing_publication_name: None,
            existing_replication_slot_name: existing_slot.map(Into::into),
            do_initial_copy: false,
            staging_path: None,
            soft_delete: false,
            snapshot_num_tables_in_parallel: 1,
            snapshot_max_parallel_workers: 4,
            sync_flow_loop_count: default_sync_flow_loops(),
        }
    }

    #[test]
    fn derived_slot_name_is_sanitized() {
        assert_eq!(configs(None).slot_name(), "sluice_slot_orders_mirror");
    }

    #[test]
    fn adopted_slot_is_not_owned() {
        let cfg = configs(Some("s0"));
        assert_eq!(cfg.slot_name(), "s0");
        assert!(!cfg.owns_slot());
        assert!(cfg.owns_publication());
    }
}
