#![allow(dead_code)]

use crate::{SNOWFLAKE_OPTIONS_ENV, TEST_PG_URL};
use connectors::postgres::client::connect_client;
use model::{
    core::data_type::DataType,
    flow::{FlowConnectionConfigs, Peer, PeerType, SyncMode},
    schema::{ColumnSchema, TableMapping, TableSchema},
};
use std::collections::HashMap;
use tokio_postgres::Client;

pub async fn pg_client() -> Client {
    connect_client(TEST_PG_URL).await.expect("connect postgres")
}

/// Execute a SQL statement in the source Postgres, panicking on any error.
pub async fn execute(sql: &str) {
    let pg = pg_client().await;
    pg.batch_execute(sql).await.expect("execute sql");
}

pub async fn get_row_count(table: &str) -> i64 {
    let pg = pg_client().await;
    let row = pg
        .query_one(&format!("SELECT COUNT(*) FROM {table}"), &[])
        .await
        .expect("count rows");
    row.get(0)
}

pub async fn slot_exists(slot: &str) -> bool {
    let pg = pg_client().await;
    let row = pg
        .query_opt(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await
        .expect("query slots");
    row.is_some()
}

pub async fn publication_exists(publication: &str) -> bool {
    let pg = pg_client().await;
    let row = pg
        .query_opt(
            "SELECT 1 FROM pg_publication WHERE pubname = $1",
            &[&publication],
        )
        .await
        .expect("query publications");
    row.is_some()
}

pub fn postgres_peer() -> Peer {
    Peer {
        name: "pg_test".into(),
        kind: PeerType::Postgres,
        options: serde_json::json!({ "url": TEST_PG_URL }),
    }
}

/// Snowflake peer built from the env blob; panics with guidance when the
/// environment is not wired.
pub fn snowflake_peer() -> Peer {
    let options = std::env::var(SNOWFLAKE_OPTIONS_ENV).unwrap_or_else(|_| {
        panic!("set {SNOWFLAKE_OPTIONS_ENV} to the snowflake peer options JSON")
    });
    Peer {
        name: "sf_test".into(),
        kind: PeerType::Snowflake,
        options: serde_json::from_str(&options).expect("parse snowflake options"),
    }
}

pub fn simple_schema(dest_table: &str) -> TableSchema {
    TableSchema {
        table_identifier: dest_table.to_string(),
        columns: vec![
            ColumnSchema::new("id", DataType::Int32),
            ColumnSchema::new("v", DataType::String),
        ],
        primary_key_columns: vec!["id".into()],
        replica_identity_full: false,
    }
}

/// CDC config for a single `t(id int primary key, v text)` style table.
pub fn flow_configs(job: &str, source_table: &str, dest_table: &str) -> FlowConnectionConfigs {
    FlowConnectionConfigs {
        flow_job_name: job.to_string(),
        source: postgres_peer(),
        destination: snowflake_peer(),
        table_mappings: vec![TableMapping {
            source_table_identifier: source_table.to_string(),
            destination_table_identifier: dest_table.to_string(),
            partition_key: None,
        }],
        table_name_schema_mapping: HashMap::from([(
            dest_table.to_string(),
            simple_schema(dest_table),
        )]),
        max_batch_size: 1_000,
        idle_timeout_secs: 5,
        sync_mode: SyncMode::MultiInsert,
        existing_publication_name: None,
        existing_replication_slot_name: None,
        do_initial_copy: false,
        staging_path: None,
        soft_delete: false,
        snapshot_num_tables_in_parallel: 1,
        snapshot_max_parallel_workers: 2,
        sync_flow_loop_count: 10,
    }
}
