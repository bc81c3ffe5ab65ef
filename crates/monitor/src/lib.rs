//! Catalog monitor: persists batch/run/partition progress to an
//! operational Postgres so operators can watch mirrors from the outside.
//! Monitor writes are a side effect, never part of the replication commit
//! path; failures are logged and swallowed by callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use connectors::{error::ConnectorError, postgres::client::connect_client};
use model::records::record::Lsn;
use std::collections::HashMap;
use tokio_postgres::Client;
use tracing::info;
use uuid::Uuid;

const STATS_SCHEMA_DDL: &str = "
CREATE SCHEMA IF NOT EXISTS sluice_stats;
CREATE TABLE IF NOT EXISTS sluice_stats.cdc_batches (
    flow_name TEXT NOT NULL,
    batch_id BIGINT NOT NULL,
    rows_in_batch INT NOT NULL,
    batch_start_lsn NUMERIC NOT NULL,
    batch_end_lsn NUMERIC NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    PRIMARY KEY (flow_name, batch_id)
);
CREATE TABLE IF NOT EXISTS sluice_stats.cdc_batch_table (
    flow_name TEXT NOT NULL,
    batch_id BIGINT NOT NULL,
    destination_table_name TEXT NOT NULL,
    num_rows BIGINT NOT NULL,
    PRIMARY KEY (flow_name, batch_id, destination_table_name)
);
CREATE TABLE IF NOT EXISTS sluice_stats.qrep_runs (
    flow_name TEXT NOT NULL,
    run_uuid UUID NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    PRIMARY KEY (flow_name, run_uuid)
);
CREATE TABLE IF NOT EXISTS sluice_stats.qrep_partitions (
    flow_name TEXT NOT NULL,
    run_uuid UUID NOT NULL,
    partition_uuid UUID NOT NULL,
    rows_in_partition BIGINT,
    start_time TIMESTAMPTZ NOT NULL,
    pull_end_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    restart_count INT NOT NULL DEFAULT 0,
    PRIMARY KEY (flow_name, run_uuid, partition_uuid)
);
";

/// Narrow sink the pipelines report progress through.
#[async_trait]
pub trait CatalogMonitor: Send + Sync {
    async fn cdc_batch_started(
        &self,
        flow: &str,
        batch_id: i64,
        start_lsn: Lsn,
        end_lsn: Lsn,
        rows: u64,
    ) -> Result<(), ConnectorError>;

    async fn cdc_batch_finished(
        &self,
        flow: &str,
        batch_id: i64,
        table_rows: &HashMap<String, u64>,
    ) -> Result<(), ConnectorError>;

    async fn qrep_run_started(&self, flow: &str, run_uuid: Uuid) -> Result<(), ConnectorError>;
    async fn qrep_run_finished(&self, flow: &str, run_uuid: Uuid) -> Result<(), ConnectorError>;

    async fn qrep_partition_started(
        &self,
        flow: &str,
        run_uuid: Uuid,
        partition_uuid: Uuid,
    ) -> Result<(), ConnectorError>;

    async fn qrep_partition_pulled(
        &self,
        flow: &str,
        run_uuid: Uuid,
        partition_uuid: Uuid,
        rows: u64,
    ) -> Result<(), ConnectorError>;

    async fn qrep_partition_finished(
        &self,
        flow: &str,
        run_uuid: Uuid,
        partition_uuid: Uuid,
    ) -> Result<(), ConnectorError>;
}

/// Monitor writing to the operational catalog database.
pub struct PostgresMonitor {
    client: Client,
}

impl PostgresMonitor {
    /// Connects and bootstraps the stats schema idempotently.
    pub async fn connect(catalog_dsn: &str) -> Result<Self, ConnectorError> {
        let client = connect_client(catalog_dsn).await?;
        client.batch_execute(STATS_SCHEMA_DDL).await?;
        info!("catalog monitor ready");
        Ok(Self { client })
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait]
impl CatalogMonitor for PostgresMonitor {
    async fn cdc_batch_started(
        &self,
        flow: &str,
        batch_id: i64,
        start_lsn: Lsn,
        end_lsn: Lsn,
        rows: u64,
    ) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "INSERT INTO sluice_stats.cdc_batches \
                 (flow_name, batch_id, rows_in_batch, batch_start_lsn, batch_end_lsn, start_time) \
                 VALUES ($1, $2, $3, $4::numeric, $5::numeric, $6) \
                 ON CONFLICT (flow_name, batch_id) DO NOTHING",
                &[
                    &flow,
                    &batch_id,
                    &(rows as i32),
                    &start_lsn.to_string(),
                    &end_lsn.to_string(),
                    &Self::now(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn cdc_batch_finished(
        &self,
        flow: &str,
        batch_id: i64,
        table_rows: &HashMap<String, u64>,
    ) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "UPDATE sluice_stats.cdc_batches SET end_time = $3 \
                 WHERE flow_name = $1 AND batch_id = $2",
                &[&flow, &batch_id, &Self::now()],
            )
            .await?;
        for (table, rows) in table_rows {
            self.client
                .execute(
                    "INSERT INTO sluice_stats.cdc_batch_table \
                     (flow_name, batch_id, destination_table_name, num_rows) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (flow_name, batch_id, destination_table_name) \
                     DO UPDATE SET num_rows = EXCLUDED.num_rows",
                    &[&flow, &batch_id, table, &(*rows as i64)],
                )
                .await?;
        }
        Ok(())
    }

    async fn qrep_run_started(&self, flow: &str, run_uuid: Uuid) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "INSERT INTO sluice_stats.qrep_runs (flow_name, run_uuid, start_time) \
                 VALUES ($1, $2, $3) ON CONFLICT (flow_name, run_uuid) DO NOTHING",
                &[&flow, &run_uuid, &Self::now()],
            )
            .await?;
        Ok(())
    }

    async fn qrep_run_finished(&self, flow: &str, run_uuid: Uuid) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "UPDATE sluice_stats.qrep_runs SET end_time = $3 \
                 WHERE flow_name = $1 AND run_uuid = $2",
                &[&flow, &run_uuid, &Self::now()],
            )
            .await?;
        Ok(())
    }

    async fn qrep_partition_started(
        &self,
        flow: &str,
        run_uuid: Uuid,
        partition_uuid: Uuid,
    ) -> Result<(), ConnectorError> {
        // A second start for the same partition is a retry; count it.
        self.client
            .execute(
                "INSERT INTO sluice_stats.qrep_partitions \
                 (flow_name, run_uuid, partition_uuid, start_time) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (flow_name, run_uuid, partition_uuid) \
                 DO UPDATE SET restart_count = sluice_stats.qrep_partitions.restart_count + 1",
                &[&flow, &run_uuid, &partition_uuid, &Self::now()],
            )
            .await?;
        Ok(())
    }

    async fn qrep_partition_pulled(
        &self,
        flow: &str,
        run_uuid: Uuid,
        partition_uuid: Uuid,
        rows: u64,
    ) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "UPDATE sluice_stats.qrep_partitions \
                 SET rows_in_partition = $4, pull_end_time = $5 \
                 WHERE flow_name = $1 AND run_uuid = $2 AND partition_uuid = $3",
                &[&flow, &run_uuid, &partition_uuid, &(rows as i64), &Self::now()],
            )
            .await?;
        Ok(())
    }

    async fn qrep_partition_finished(
        &self,
        flow: &str,
        run_uuid: Uuid,
        partition_uuid: Uuid,
    ) -> Result<(), ConnectorError> {
        self.client
            .execute(
                "UPDATE sluice_stats.qrep_partitions SET end_time = $4 \
                 WHERE flow_name = $1 AND run_uuid = $2 AND partition_uuid = $3",
                &[&flow, &run_uuid, &partition_uuid, &Self::now()],
            )
            .await?;
        Ok(())
    }
}

/// Monitor used when no catalog is configured (tests, local runs).
#[derive(Default, Clone)]
pub struct NoopMonitor;

#[async_trait]
impl CatalogMonitor for NoopMonitor {
    async fn cdc_batch_started(
        &self,
        _flow: &str,
        _batch_id: i64,
        _start_lsn: Lsn,
        _end_lsn: Lsn,
        _rows: u64,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn cdc_batch_finished(
        &self,
        _flow: &str,
        _batch_id: i64,
        _table_rows: &HashMap<String, u64>,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn qrep_run_started(&self, _flow: &str, _run_uuid: Uuid) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn qrep_run_finished(&self, _flow: &str, _run_uuid: Uuid) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn qrep_partition_started(
        &self,
        _flow: &str,
        _run_uuid: Uuid,
        _partition_uuid: Uuid,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn qrep_partition_pulled(
        &self,
        _flow: &str,
        _run_uuid: Uuid,
        _partition_uuid: Uuid,
        _rows: u64,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn qrep_partition_finished(
        &self,
        _flow: &str,
        _run_uuid: Uuid,
        _partition_uuid: Uuid,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }
}
