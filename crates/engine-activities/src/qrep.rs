use crate::{
    context::{QRepContext, spawn_heartbeat},
    error::classify,
};
use connectors::core::{QRepPullConnector, QRepSyncConnector};
use engine_core::{
    activity::{ActivityOptions, execute_activity},
    error::ActivityError,
};
use model::{partition::QRepPartition, records::stream::record_stream};
use monitor::CatalogMonitor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Records in flight between the partition reader and the destination
/// writer; the producer blocks once it is full.
const FETCH_AND_CHANNEL_SIZE: usize = 4096;

/// Long MERGE/COPY calls on the destination beat slowly.
const QREP_HEARTBEAT: Duration = Duration::from_secs(120);

pub async fn get_qrep_partitions(
    ctx: &QRepContext,
    last: Option<QRepPartition>,
) -> Result<Vec<QRepPartition>, ActivityError> {
    let opts = ActivityOptions::new("get-qrep-partitions").with_heartbeat(QREP_HEARTBEAT);
    execute_activity(&opts, &ctx.cancel, |actx| {
        let last = last.clone();
        async move {
            let _beat = spawn_heartbeat(&actx, Duration::from_secs(15));
            ctx.source
                .qrep()
                .get_qrep_partitions(&ctx.config, last.as_ref())
                .await
                .map_err(classify)
        }
    })
    .await
}

/// Replicates one partition through an in-memory record stream. Skips
/// immediately when the destination sentinel shows the partition already
/// landed, which is what makes restarts cheap.
pub async fn replicate_partition(
    ctx: &QRepContext,
    partition: &QRepPartition,
) -> Result<u64, ActivityError> {
    let opts = ActivityOptions::new("replicate-qrep-partition").with_heartbeat(QREP_HEARTBEAT);
    execute_activity(&opts, &ctx.cancel, |actx| async move {
        let _beat = spawn_heartbeat(&actx, Duration::from_secs(15));
        let config = &ctx.config;

        if ctx
            .destination
            .qrep()
            .is_qrep_partition_synced(config, partition.partition_id)
            .await
            .map_err(classify)?
        {
            debug!(partition = %partition.partition_id, "partition already synced, skipping");
            return Ok(0);
        }

        if let Err(err) = ctx
            .monitor
            .qrep_partition_started(&config.flow_job_name, partition.run_uuid, partition.partition_id)
            .await
        {
            warn!(error = %err, "failed to record partition start in catalog");
        }

        let (sender, receiver) = record_stream(FETCH_AND_CHANNEL_SIZE);

        let pull_source = ctx.source.clone();
        let pull_config = ctx.config.clone();
        let pull_partition = partition.clone();
        let puller = tokio::spawn(async move {
            pull_source
                .qrep()
                .pull_qrep_records(&pull_config, &pull_partition, sender)
                .await
        });

        let rows_synced = ctx
            .destination
            .qrep()
            .sync_qrep_records(config, partition, receiver)
            .await
            .map_err(classify)?;

        let rows_pulled = puller
            .await
            .map_err(|e| ActivityError::Transient(format!("partition reader panicked: {e}")))?
            .map_err(classify)?;

        if let Err(err) = ctx
            .monitor
            .qrep_partition_pulled(
                &config.flow_job_name,
                partition.run_uuid,
                partition.partition_id,
                rows_pulled,
            )
            .await
        {
            warn!(error = %err, "failed to record partition pull in catalog");
        }
        if let Err(err) = ctx
            .monitor
            .qrep_partition_finished(&config.flow_job_name, partition.run_uuid, partition.partition_id)
            .await
        {
            warn!(error = %err, "failed to record partition finish in catalog");
        }

        info!(
            flow = %config.flow_job_name,
            partition = %partition.partition_id,
            rows = rows_synced,
            "partition replicated"
        );
        Ok(rows_synced)
    })
    .await
}

pub async fn setup_qrep_metadata(ctx: &QRepContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("setup-qrep-metadata");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.destination
            .qrep()
            .setup_qrep_metadata_tables(&ctx.config)
            .await
            .map_err(classify)
    })
    .await
}

pub async fn consolidate_partitions(ctx: &QRepContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("consolidate-qrep-partitions").with_heartbeat(QREP_HEARTBEAT);
    execute_activity(&opts, &ctx.cancel, |actx| async move {
        let _beat = spawn_heartbeat(&actx, Duration::from_secs(15));
        match ctx
            .destination
            .qrep()
            .consolidate_qrep_partitions(&ctx.config)
            .await
        {
            Ok(()) => Ok(()),
            // A destination without a consolidation stage is fine; the
            // partition loads already committed.
            Err(err) => {
                let classified = classify(err);
                if classified.is_unsupported() {
                    Ok(())
                } else {
                    Err(classified)
                }
            }
        }
    })
    .await
}

pub async fn cleanup_qrep_flow(ctx: &QRepContext) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("cleanup-qrep-flow");
    execute_activity(&opts, &ctx.cancel, |_actx| async move {
        ctx.destination
            .qrep()
            .qrep_flow_cleanup(&ctx.config.flow_job_name)
            .await
            .map_err(classify)
    })
    .await
}

/// Polls the source watermark until it moves past the last replicated
/// position.
pub async fn wait_until_new_rows(
    ctx: &QRepContext,
    last: &QRepPartition,
    poll_interval: Duration,
) -> Result<(), ActivityError> {
    let opts = ActivityOptions::new("qrep-wait-until-new-rows").with_heartbeat(QREP_HEARTBEAT);
    execute_activity(&opts, &ctx.cancel, |actx| async move {
        let _beat = spawn_heartbeat(&actx, Duration::from_secs(15));
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ActivityError::Cancelled);
            }
            let max = ctx
                .source
                .qrep()
                .fetch_max_watermark(&ctx.config)
                .await
                .map_err(classify)?;
            if let Some(max) = max {
                if watermark_advanced(last, &max) {
                    return Ok(());
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    })
    .await
}

fn watermark_advanced(last: &QRepPartition, max: &model::core::value::Value) -> bool {
    use model::{core::value::Value, partition::PartitionRange};
    match (&last.range, max) {
        (PartitionRange::Int { end, .. }, value) => value.as_i64().is_some_and(|v| v > *end),
        (PartitionRange::Timestamp { end, .. }, Value::Timestamp(ts)) => ts > end,
        // Tid/full-table runs have no comparable watermark; treat any poll
        // as new rows and let partition discovery decide.
        _ => true,
    }
}
