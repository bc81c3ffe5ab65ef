use crate::{
    core::QRepSyncConnector,
    error::ConnectorError,
    snowflake::{destination::SnowflakeDestination, sql},
    staging::{avro::stream_to_avro, store::StagingLocation},
};
use async_trait::async_trait;
use model::{
    core::identifiers::{sanitize, snowflake_ident},
    flow::{QRepConfig, SyncMode},
    partition::QRepPartition,
    records::stream::{QRecordReceiver, QRecordSchema},
};
use tracing::{debug, info};
use uuid::Uuid;

fn quoted_columns(schema: &QRecordSchema) -> Vec<String> {
    schema
        .fields
        .iter()
        .map(|f| format!("\"{}\"", snowflake_ident(&f.name)))
        .collect()
}

fn sentinel_insert_sql(config: &QRepConfig, partition: &QRepPartition, rows: u64) -> String {
    format!(
        "INSERT INTO {} (FLOW_JOB_NAME, RUN_UUID, PARTITION_UUID, ROWS_SYNCED, SYNCED_AT) \
         VALUES ('{}', '{}', '{}', {rows}, CURRENT_TIMESTAMP)",
        sql::QREP_PARTITIONS_TABLE,
        config.flow_job_name.replace('\'', "''"),
        partition.run_uuid,
        partition.partition_id,
    )
}

fn copy_from_s3_sql(config: &QRepConfig, schema: &QRecordSchema, uri: &str) -> String {
    let columns = quoted_columns(schema).join(", ");
    let key_id = std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default();
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default();
    format!(
        "COPY INTO {} ({columns}) FROM '{uri}' \
         CREDENTIALS = (AWS_KEY_ID = '{key_id}' AWS_SECRET_KEY = '{secret}') \
         FILE_FORMAT = (TYPE = AVRO) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE",
        sql::quote_table(&config.destination_table_identifier)
    )
}

#[async_trait]
impl QRepSyncConnector for SnowflakeDestination {
    async fn setup_qrep_metadata_tables(
        &self,
        _config: &QRepConfig,
    ) -> Result<(), ConnectorError> {
        for ddl in sql::metadata_tables_ddl() {
            self.client().execute(&ddl).await?;
        }
        Ok(())
    }

    async fn is_qrep_partition_synced(
        &self,
        config: &QRepConfig,
        partition_id: Uuid,
    ) -> Result<bool, ConnectorError> {
        let result = self
            .client()
            .execute(&format!(
                "SELECT COUNT(*) FROM {} WHERE FLOW_JOB_NAME = '{}' AND PARTITION_UUID = '{}'",
                sql::QREP_PARTITIONS_TABLE,
                config.flow_job_name.replace('\'', "''"),
                partition_id,
            ))
            .await?;
        Ok(result.i64_cell(0, 0).unwrap_or(0) > 0)
    }

    /// Drains one partition's stream into the destination table. Rows plus
    /// the completion sentinel commit atomically, so a replayed partition
    /// either skips entirely or lands exactly once.
    async fn sync_qrep_records(
        &self,
        config: &QRepConfig,
        partition: &QRepPartition,
        mut receiver: QRecordReceiver,
    ) -> Result<u64, ConnectorError> {
        let schema = receiver.schema().await?;

        match config.sync_mode {
            SyncMode::MultiInsert => {
                let columns = quoted_columns(&schema).join(", ");
                let target = sql::quote_table(&config.destination_table_identifier);
                let mut statements = Vec::new();
                let mut tuples: Vec<String> = Vec::with_capacity(config.batch_size_int);
                let mut rows: u64 = 0;

                while let Some(item) = receiver.recv().await {
                    let record = item?;
                    let rendered = record
                        .values
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    tuples.push(format!("({rendered})"));
                    rows += 1;
                    if tuples.len() >= config.batch_size_int.max(1) {
                        statements.push(format!(
                            "INSERT INTO {target} ({columns}) VALUES {}",
                            tuples.join(", ")
                        ));
                        tuples.clear();
                    }
                }
                if !tuples.is_empty() {
                    statements.push(format!(
                        "INSERT INTO {target} ({columns}) VALUES {}",
                        tuples.join(", ")
                    ));
                }
                statements.push(sentinel_insert_sql(config, partition, rows));
                self.client().execute_transaction(&statements).await?;

                info!(
                    flow = %config.flow_job_name,
                    partition = %partition.partition_id,
                    rows,
                    "partition synced via multi-insert"
                );
                Ok(rows)
            }
            SyncMode::StorageAvro => {
                let staging_path = config.staging_path.as_deref().ok_or_else(|| {
                    ConnectorError::Precondition(
                        "avro sync mode requires a staging_path".into(),
                    )
                })?;
                let location = StagingLocation::parse(staging_path)?;

                let (bytes, rows) = stream_to_avro(
                    &config.destination_table_identifier,
                    &schema,
                    &mut receiver,
                )
                .await?;
                let key = format!(
                    "{}/{}/{}.avro",
                    sanitize(&config.flow_job_name),
                    partition.run_uuid,
                    partition.partition_id
                );
                let uri = location.put(&key, bytes).await?;
                debug!(partition = %partition.partition_id, uri = %uri, "partition staged");

                let StagingLocation::S3 { .. } = location else {
                    return Err(ConnectorError::Precondition(format!(
                        "destination COPY cannot read local staging path {staging_path}; \
                         use an s3:// staging path"
                    )));
                };

                let statements = vec![
                    copy_from_s3_sql(config, &schema, &uri),
                    sentinel_insert_sql(config, partition, rows),
                ];
                self.client().execute_transaction(&statements).await?;

                info!(
                    flow = %config.flow_job_name,
                    partition = %partition.partition_id,
                    rows,
                    "partition synced via staged avro"
                );
                Ok(rows)
            }
        }
    }

    async fn consolidate_qrep_partitions(
        &self,
        config: &QRepConfig,
    ) -> Result<(), ConnectorError> {
        // Partition loads commit straight into the destination table; the
        // consolidation step only has to confirm the run's sentinels exist.
        let result = self
            .client()
            .execute(&format!(
                "SELECT COUNT(*), COALESCE(SUM(ROWS_SYNCED), 0) FROM {} \
                 WHERE FLOW_JOB_NAME = '{}'",
                sql::QREP_PARTITIONS_TABLE,
                config.flow_job_name.replace('\'', "''"),
            ))
            .await?;
        info!(
            flow = %config.flow_job_name,
            partitions = result.i64_cell(0, 0).unwrap_or(0),
            rows = result.i64_cell(0, 1).unwrap_or(0),
            "consolidated partition runs"
        );
        Ok(())
    }

    async fn qrep_flow_cleanup(&self, flow_job_name: &str) -> Result<(), ConnectorError> {
        self.client()
            .execute(&format!(
                "DELETE FROM {} WHERE FLOW_JOB_NAME = '{}'",
                sql::QREP_PARTITIONS_TABLE,
                flow_job_name.replace('\'', "''"),
            ))
            .await?;
        info!(flow = %flow_job_name, "query replication metadata removed");
        Ok(())
    }
}
