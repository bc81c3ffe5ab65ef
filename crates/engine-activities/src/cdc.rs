use crate::{
    context::{FlowContext, spawn_heartbeat},
    error::classify,
};
use connectors::core::{
    CdcPullConnector, CdcSyncConnector, NormalizeRecordsRequest, NormalizeResponse,
    PullFlowCleanupRequest, PullRecordsRequest, SyncRecordsRequest, SyncResponse,
};
use engine_core::{
    activity::{ActivityOptions, execute_activity},
    error::ActivityError,
};
use model::schema::TableSchemaDelta;
use monitor::CatalogMonitor;
use std::{collections::HashMap, time::Duration};
use tracing::{info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct StartFlowOutput {
    /// `None` when the pull produced no records.
    pub sync_response: Option<SyncResponse>,
    pub schema_deltas: Vec<TableSchemaDelta>,
}

/// One pull→sync step. The destination transaction is the durability
/// boundary: the offset only moves once the raw rows and metadata are
/// committed there, so replaying this step after any failure is safe.
pub async fn start_flow(ctx: &FlowContext) -> Result<StartFlowOutput, ActivityError> {
    let opts = ActivityOptions::new("start-flow").with_heartbeat(HEARTBEAT_INTERVAL);
    execute_activity(&opts, &ctx.cancel, |actx| async move {
        let _beat = spawn_heartbeat(&actx, HEARTBEAT_INTERVAL / 2);
        let config = &ctx.config;
        let source = ctx.source.cdc();
        let destination = ctx.destination.cdc();

        let last_offset = destination
            .get_last_offset(&config.flow_job_name)
            .await
            .map_err(classify)?;

        let table_name_mapping: HashMap<String, String> = config
            .table_mappings
            .iter()
            .map(|m| {
                (
                    m.source_table_identifier.clone(),
                    m.destination_table_identifier.clone(),
                )
            })
            .collect();

        let pull_req = PullRecordsRequest {
            flow_job_name: config.flow_job_name.clone(),
            slot_name: config.slot_name(),
            publication_name: config.publication_name(),
            last_offset,
            max_batch_size: config.max_batch_size,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            table_name_mapping,
            table_name_schema_mapping: config.table_name_schema_mapping.clone(),
        };
        let batch = source.pull_records(&pull_req).await.map_err(classify)?;
        let schema_deltas = batch.schema_deltas.clone();

        if batch.is_empty() {
            return Ok(StartFlowOutput {
                sync_response: None,
                schema_deltas,
            });
        }

        let sync_req = SyncRecordsRequest {
            flow_job_name: config.flow_job_name.clone(),
            batch,
        };
        let response = destination
            .sync_records(&sync_req)
            .await
            .map_err(classify)?;

        // Monitoring rows ride outside the replication commit path.
        if let Err(err) = ctx
            .monitor
            .cdc_batch_started(
                &config.flow_job_name,
                response.current_sync_batch_id,
                response.first_synced_checkpoint,
                response.last_synced_checkpoint,
                response.num_records_synced,
            )
            .await
        {
            warn!(error = %err, "failed to record batch start in catalog");
        }
        if let Err(err) = ctx
            .monitor
            .cdc_batch_finished(
                &config.flow_job_name,
                response.current_sync_batch_id,
                &response.table_name_rows_mapping,
            )
            .await
        {
            warn!(error = %err, "failed to record batch finish in catalog");
        }

        // Slot feedback after the destination commit. Failure here only
        // delays WAL release; the next successful step catches up.
        if let Err(err) = source
            .confirm_flushed_offset(&config.slot_name(), response.last_synced_checkpoint)
            .await
        {
            warn!(error = %err, "failed to advance slot flush position");
        }

        Ok(StartFlowOutput {
            sync_response: Some(response),
            schema_deltas,
        })
    })
    .await
}

/// Merges synced batches into the normalized tables. Idempotent on the
/// batch window: a retry sees the advanced normalize id and does nothing.
pub async fn start_normalize(ctx: &FlowContext) -> Result<NormalizeResponse, ActivityError> {
    let opts = ActivityOptions::new("start-normalize").with_heartbeat(Duration::from_secs(120));
    execute_activity(&opts, &ctx.cancel, |actx| async move {
        let _beat = spawn_heartbeat(&actx, Duration::from_secs(30));
        let req = NormalizeRecordsRequest {
            flow_job_name: ctx.config.flow_job_name.clone(),
            soft_delete: ctx.config.soft_delete,
            table_name_schema_mapping: ctx.config.table_name_schema_mapping.clone(),
        };
        ctx.destination
            .cdc()
            .normalize_records(&req)
            .await
            .map_err(classify)
    })
    .await
}

/// Applies additive schema drift to the destination before the next pull.
pub async fn replay_schema_deltas(
    ctx: &FlowContext,
    deltas: &[TableSchemaDelta],
) -> Result<(), ActivityError> {
    if deltas.is_empty() {
        return Ok(());
    }
    let opts = ActivityOptions::new("replay-schema-deltas");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.destination
            .cdc()
            .replay_table_schema_deltas(&ctx.config.flow_job_name, deltas)
            .await
            .map_err(classify)
    })
    .await
}

/// Keeps an idle slot from pinning WAL when no CDC traffic flows.
pub async fn send_wal_heartbeat(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("wal-heartbeat");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.source
            .cdc()
            .send_wal_heartbeat()
            .await
            .map_err(classify)
    })
    .await
}

/// Tears the flow down on both sides: slot and publication go only if this
/// job created them; the raw table and metadata row always go.
pub async fn drop_flow(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("drop-flow");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        let config = &ctx.config;
        let cleanup = PullFlowCleanupRequest {
            flow_job_name: config.flow_job_name.clone(),
            slot_name: config.slot_name(),
            publication_name: config.publication_name(),
            drop_slot: config.owns_slot(),
            drop_publication: config.owns_publication(),
        };
        ctx.source
            .cdc()
            .pull_flow_cleanup(&cleanup)
            .await
            .map_err(classify)?;
        ctx.destination
            .cdc()
            .sync_flow_cleanup(&config.flow_job_name)
            .await
            .map_err(classify)?;
        info!(flow = %config.flow_job_name, "flow dropped");
        Ok(())
    })
    .await
}
