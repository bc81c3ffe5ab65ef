use crate::{error::FlowError, qrep::run_qrep_pass};
use engine_activities::context::{FlowContext, QRepContext};
use futures::{StreamExt, stream};
use model::{
    core::{data_type::DataType, identifiers::quote_postgres_ident},
    flow::QRepConfig,
    records::record::{Lsn, format_lsn},
    schema::TableMapping,
};
use tracing::{info, warn};

/// Rows per partition during the initial copy; tuned for wide tables.
const SNAPSHOT_ROWS_PER_PARTITION: u64 = 250_000;

/// Builds the per-table bulk-copy config. The watermark rides the primary
/// key when there is exactly one integer key column; otherwise physical
/// tuple ids carve the table.
fn snapshot_qrep_config(
    flow: &FlowContext,
    mapping: &TableMapping,
    snapshot_name: &str,
) -> QRepConfig {
    let config = &flow.config;
    let schema = config
        .table_name_schema_mapping
        .get(&mapping.destination_table_identifier);

    let int_pk = schema.and_then(|s| {
        if s.primary_key_columns.len() != 1 {
            return None;
        }
        let pk = &s.primary_key_columns[0];
        let col = s.column(pk)?;
        matches!(col.data_type, DataType::Int32 | DataType::Int64).then(|| pk.clone())
    });

    let source_table = quote_postgres_ident(&mapping.source_table_identifier);
    let (watermark_column, query) = match &int_pk {
        Some(pk) => {
            let quoted_pk = quote_postgres_ident(pk);
            (
                pk.clone(),
                format!(
                    "SELECT * FROM {source_table} \
                     WHERE {quoted_pk} > {{{{.start}}}} AND {quoted_pk} <= {{{{.end}}}}"
                ),
            )
        }
        None => (
            "ctid".to_string(),
            format!(
                "SELECT * FROM {source_table} \
                 WHERE ctid > {{{{.start}}}} AND ctid <= {{{{.end}}}}"
            ),
        ),
    };

    QRepConfig {
        flow_job_name: format!(
            "{}_snapshot_{}",
            config.flow_job_name,
            model::core::identifiers::sanitize(&mapping.destination_table_identifier)
        ),
        source: config.source.clone(),
        destination: config.destination.clone(),
        query,
        watermark_table: mapping.source_table_identifier.clone(),
        watermark_column,
        destination_table_identifier: mapping.destination_table_identifier.clone(),
        num_rows_per_partition: SNAPSHOT_ROWS_PER_PARTITION,
        max_parallel_workers: config.snapshot_max_parallel_workers,
        batch_size_int: 1_000,
        sync_mode: config.sync_mode,
        staging_path: config.staging_path.clone(),
        initial_copy_only: true,
        wait_between_batches_secs: 0,
        snapshot_name: Some(snapshot_name.to_string()),
    }
}

/// Copies every mapped table under the exported snapshot. The consistent
/// point is the slot position the snapshot was carved at: CDC consumption
/// must only begin once this flow returns, so changes past that point are
/// replayed onto the copied baseline instead of racing it.
pub async fn run_snapshot_flow(
    flow: &FlowContext,
    snapshot_name: &str,
    consistent_point: Lsn,
) -> Result<(), FlowError> {
    info!(
        flow = %flow.config.flow_job_name,
        snapshot = %snapshot_name,
        consistent_point = %format_lsn(consistent_point),
        tables = flow.config.table_mappings.len(),
        "starting snapshot flow"
    );

    let parallel_tables = flow.config.snapshot_num_tables_in_parallel.max(1);
    let mut tables = stream::iter(flow.config.table_mappings.clone())
        .map(|mapping| {
            let qrep_ctx = QRepContext {
                config: std::sync::Arc::new(snapshot_qrep_config(flow, &mapping, snapshot_name)),
                source: flow.source.clone(),
                destination: flow.destination.clone(),
                monitor: flow.monitor.clone(),
                cancel: flow.cancel.clone(),
            };
            tokio::spawn(async move {
                let table = qrep_ctx.config.destination_table_identifier.clone();
                let result = match run_qrep_pass(&qrep_ctx, None).await {
                    Ok(summary) => {
                        // Copy landed; retire this table's restart markers.
                        engine_activities::qrep::cleanup_qrep_flow(&qrep_ctx)
                            .await
                            .map(|()| summary)
                            .map_err(FlowError::Activity)
                    }
                    Err(err) => Err(err),
                };
                (table, result)
            })
        })
        .buffer_unordered(parallel_tables);

    while let Some(joined) = tables.next().await {
        match joined {
            Ok((table, Ok(_))) => {
                info!(table = %table, "table snapshot complete");
            }
            Ok((table, Err(err))) => {
                warn!(table = %table, error = %err, "table snapshot failed");
                return Err(err);
            }
            Err(err) => {
                return Err(FlowError::Activity(
                    engine_core::error::ActivityError::Transient(format!(
                        "snapshot worker panicked: {err}"
                    )),
                ));
            }
        }
    }

    info!(flow = %flow.config.flow_job_name, "snapshot flow complete");
    Ok(())
}
