use crate::{
    core::{
        CdcSyncConnector, NormalizeRecordsRequest, NormalizeResponse, SyncRecordsRequest,
        SyncResponse,
    },
    error::ConnectorError,
    snowflake::{
        client::{SnowflakeClient, SnowflakeConfig},
        sql,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use model::{
    records::record::Lsn,
    schema::{TableSchema, TableSchemaDelta},
};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Rows per INSERT statement when landing a batch in the raw table.
const RAW_ROWS_PER_CHUNK: usize = 1024;

pub struct SnowflakeDestination {
    client: SnowflakeClient,
}

impl SnowflakeDestination {
    pub async fn connect(peer: &model::flow::Peer) -> Result<Self, ConnectorError> {
        let config = SnowflakeConfig::from_peer(peer)?;
        let client = SnowflakeClient::new(config)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &SnowflakeClient {
        &self.client
    }

    async fn metadata_row(
        &self,
        flow_job_name: &str,
    ) -> Result<Option<(Lsn, i64, i64)>, ConnectorError> {
        let result = self
            .client
            .execute(&sql::select_metadata_sql(flow_job_name))
            .await?;
        if result.is_empty() {
            return Ok(None);
        }
        let offset = result.i64_cell(0, 0).unwrap_or(0).max(0) as Lsn;
        let sync_batch_id = result.i64_cell(0, 1).unwrap_or(0);
        let normalize_batch_id = result.i64_cell(0, 2).unwrap_or(0);
        Ok(Some((offset, sync_batch_id, normalize_batch_id)))
    }
}

#[async_trait]
impl CdcSyncConnector for SnowflakeDestination {
    async fn check_connection(&self) -> Result<(), ConnectorError> {
        self.client.execute("SELECT 1").await?;
        Ok(())
    }

    async fn needs_setup_metadata_tables(&self) -> Result<bool, ConnectorError> {
        let result = self.client.execute(&sql::metadata_tables_probe()).await?;
        Ok(result.i64_cell(0, 0).unwrap_or(0) == 0)
    }

    async fn setup_metadata_tables(&self) -> Result<(), ConnectorError> {
        for ddl in sql::metadata_tables_ddl() {
            self.client.execute(&ddl).await?;
        }
        info!("metadata tables ready");
        Ok(())
    }

    async fn create_raw_table(&self, flow_job_name: &str) -> Result<(), ConnectorError> {
        self.client
            .execute(&sql::raw_table_ddl(flow_job_name))
            .await?;
        info!(flow = %flow_job_name, "raw table ready");
        Ok(())
    }

    async fn setup_normalized_tables(
        &self,
        schemas: &HashMap<String, TableSchema>,
        soft_delete: bool,
    ) -> Result<(), ConnectorError> {
        for schema in schemas.values() {
            self.client
                .execute(&sql::normalized_table_ddl(schema, soft_delete))
                .await?;
            debug!(table = %schema.table_identifier, "normalized table ready");
        }
        Ok(())
    }

    async fn get_last_offset(&self, flow_job_name: &str) -> Result<Lsn, ConnectorError> {
        Ok(self
            .metadata_row(flow_job_name)
            .await?
            .map(|(offset, _, _)| offset)
            .unwrap_or(0))
    }

    async fn get_last_sync_batch_id(&self, flow_job_name: &str) -> Result<i64, ConnectorError> {
        Ok(self
            .metadata_row(flow_job_name)
            .await?
            .map(|(_, sync, _)| sync)
            .unwrap_or(0))
    }

    async fn get_last_normalize_batch_id(
        &self,
        flow_job_name: &str,
    ) -> Result<i64, ConnectorError> {
        Ok(self
            .metadata_row(flow_job_name)
            .await?
            .map(|(_, _, normalize)| normalize)
            .unwrap_or(0))
    }

    /// Lands the batch in the raw table and advances the sync metadata, all
    /// inside one destination transaction. A failed attempt leaves no trace,
    /// so the whole step can be retried.
    async fn sync_records(&self, req: &SyncRecordsRequest) -> Result<SyncResponse, ConnectorError> {
        let batch = &req.batch;
        if batch.is_empty() {
            return Ok(SyncResponse::default());
        }

        let sync_batch_id = self.get_last_sync_batch_id(&req.flow_job_name).await? + 1;
        // Timestamps increase in commit order within the batch, so the
        // dedup rank in the normalize step sees source ordering even when
        // several events touch one key.
        let now = Utc::now();
        let raw_rows: Vec<sql::RawRow> = batch
            .records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let at = now + chrono::Duration::nanoseconds(idx as i64);
                sql::RawRow::from_record(record, Uuid::new_v4(), at)
            })
            .collect();

        let mut statements = Vec::with_capacity(raw_rows.len() / RAW_ROWS_PER_CHUNK + 2);
        for chunk in raw_rows.chunks(RAW_ROWS_PER_CHUNK) {
            statements.push(sql::insert_raw_rows_sql(
                &req.flow_job_name,
                sync_batch_id,
                chunk,
            ));
        }
        statements.push(sql::upsert_metadata_sql(
            &req.flow_job_name,
            batch.last_checkpoint,
            sync_batch_id,
        ));
        self.client.execute_transaction(&statements).await?;

        info!(
            flow = %req.flow_job_name,
            batch_id = sync_batch_id,
            rows = batch.len(),
            "synced record batch"
        );
        Ok(SyncResponse {
            first_synced_checkpoint: batch.first_checkpoint,
            last_synced_checkpoint: batch.last_checkpoint,
            num_records_synced: batch.len() as u64,
            current_sync_batch_id: sync_batch_id,
            table_name_rows_mapping: batch.table_row_counts(),
        })
    }

    /// Merges everything between the last normalized batch and the last
    /// synced batch into the target tables, then advances the watermark in
    /// the same transaction.
    async fn normalize_records(
        &self,
        req: &NormalizeRecordsRequest,
    ) -> Result<NormalizeResponse, ConnectorError> {
        let Some((_, sync_batch_id, normalize_batch_id)) =
            self.metadata_row(&req.flow_job_name).await?
        else {
            return Ok(NormalizeResponse {
                done: true,
                ..Default::default()
            });
        };
        if sync_batch_id == normalize_batch_id {
            return Ok(NormalizeResponse {
                done: true,
                start_batch_id: normalize_batch_id,
                end_batch_id: sync_batch_id,
            });
        }

        let touched = self
            .client
            .execute(&sql::distinct_tables_sql(
                &req.flow_job_name,
                normalize_batch_id,
                sync_batch_id,
            ))
            .await?;

        let mut statements = Vec::new();
        for row in 0..touched.data.len() {
            let Some(table_name) = touched.cell(row, 0) else {
                continue;
            };
            let schema = req
                .table_name_schema_mapping
                .iter()
                .find(|(dest, _)| sql::table_key(dest) == table_name)
                .map(|(_, schema)| schema)
                .ok_or_else(|| {
                    ConnectorError::Precondition(format!(
                        "no schema declared for destination table {table_name}"
                    ))
                })?;
            statements.push(sql::merge_statement(
                &req.flow_job_name,
                schema,
                normalize_batch_id,
                sync_batch_id,
                req.soft_delete,
            ));
        }
        statements.push(sql::update_normalize_batch_sql(
            &req.flow_job_name,
            sync_batch_id,
        ));
        self.client.execute_transaction(&statements).await?;

        info!(
            flow = %req.flow_job_name,
            from_batch = normalize_batch_id,
            to_batch = sync_batch_id,
            tables = statements.len() - 1,
            "normalized record batches"
        );
        Ok(NormalizeResponse {
            done: false,
            start_batch_id: normalize_batch_id + 1,
            end_batch_id: sync_batch_id,
        })
    }

    async fn replay_table_schema_deltas(
        &self,
        flow_job_name: &str,
        deltas: &[TableSchemaDelta],
    ) -> Result<(), ConnectorError> {
        for delta in deltas {
            for column in &delta.added_columns {
                self.client
                    .execute(&sql::add_column_ddl(&delta.dst_table_name, column))
                    .await?;
                info!(
                    flow = %flow_job_name,
                    table = %delta.dst_table_name,
                    column = %column.name,
                    "replayed added column"
                );
            }
        }
        Ok(())
    }

    async fn sync_flow_cleanup(&self, flow_job_name: &str) -> Result<(), ConnectorError> {
        let statements = vec![
            format!(
                "DROP TABLE IF EXISTS {}",
                sql::qualified_raw_table(flow_job_name)
            ),
            sql::delete_metadata_sql(flow_job_name),
        ];
        self.client.execute_transaction(&statements).await?;
        info!(flow = %flow_job_name, "destination flow state removed");
        Ok(())
    }
}
