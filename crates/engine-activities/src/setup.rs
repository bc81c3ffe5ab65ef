use crate::{context::FlowContext, error::classify};
use connectors::core::{
    CdcPullConnector, CdcSyncConnector, SetupReplicationOutput, SetupReplicationRequest,
};
use engine_core::{
    activity::{ActivityOptions, execute_activity},
    error::ActivityError,
};
use tracing::info;

/// Verifies both peers answer before any setup work happens.
pub async fn check_connections(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("check-connections");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.source.cdc().check_connection().await.map_err(classify)?;
        ctx.destination
            .cdc()
            .check_connection()
            .await
            .map_err(classify)?;
        Ok(())
    })
    .await
}

/// Creates the destination's internal metadata tables when missing.
pub async fn setup_metadata_tables(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("setup-metadata-tables");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        let dest = ctx.destination.cdc();
        if dest.needs_setup_metadata_tables().await.map_err(classify)? {
            dest.setup_metadata_tables().await.map_err(classify)?;
        }
        Ok(())
    })
    .await
}

pub async fn ensure_pullability(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("ensure-pullability");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        let tables: Vec<String> = ctx
            .config
            .table_mappings
            .iter()
            .map(|m| m.source_table_identifier.clone())
            .collect();
        ctx.source
            .cdc()
            .ensure_pullability(&tables)
            .await
            .map_err(classify)
    })
    .await
}

/// Creates or adopts the slot and publication. The returned snapshot name
/// and consistent point feed the snapshot flow when an initial copy was
/// requested.
pub async fn setup_replication(
    ctx: &FlowContext,
) -> Result<SetupReplicationOutput, ActivityError> {
    let opts = ActivityOptions::new("setup-replication");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        let config = &ctx.config;
        let req = SetupReplicationRequest {
            flow_job_name: config.flow_job_name.clone(),
            slot_name: config.slot_name(),
            publication_name: config.publication_name(),
            create_slot: config.owns_slot(),
            create_publication: config.owns_publication(),
            source_tables: config
                .table_mappings
                .iter()
                .map(|m| m.source_table_identifier.clone())
                .collect(),
            do_initial_copy: config.do_initial_copy,
        };
        let output = ctx
            .source
            .cdc()
            .setup_replication(&req)
            .await
            .map_err(classify)?;
        info!(
            flow = %config.flow_job_name,
            slot = %output.slot_name,
            snapshot = ?output.snapshot_name,
            "replication setup complete"
        );
        Ok(output)
    })
    .await
}

pub async fn create_raw_table(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("create-raw-table");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.destination
            .cdc()
            .create_raw_table(&ctx.config.flow_job_name)
            .await
            .map_err(classify)
    })
    .await
}

pub async fn setup_normalized_tables(ctx: &FlowContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("setup-normalized-tables");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.destination
            .cdc()
            .setup_normalized_tables(&ctx.config.table_name_schema_mapping, ctx.config.soft_delete)
            .await
            .map_err(classify)
    })
    .await
}
