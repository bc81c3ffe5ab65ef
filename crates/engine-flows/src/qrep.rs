use crate::error::FlowError;
use engine_activities::{context::QRepContext, qrep};
use engine_core::state::{FlowStateStore, models::QRepFlowState};
use futures::{StreamExt, stream};
use model::partition::QRepPartition;
use monitor::CatalogMonitor;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const WATERMARK_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What one replication pass accomplished.
#[derive(Debug, Clone, PartialEq)]
pub struct QRepPassSummary {
    /// Final partition of the pass (or the previous one when idle); the
    /// next pass resumes past it.
    pub last_partition: Option<QRepPartition>,
    pub partitions_processed: u64,
}

/// One replication pass: discover partitions after `last`, replicate them
/// with bounded parallelism, consolidate.
pub async fn run_qrep_pass(
    ctx: &QRepContext,
    last: Option<QRepPartition>,
) -> Result<QRepPassSummary, FlowError> {
    let partitions = qrep::get_qrep_partitions(ctx, last.clone()).await?;
    if partitions.is_empty() {
        return Ok(QRepPassSummary {
            last_partition: last,
            partitions_processed: 0,
        });
    }
    let run_uuid = partitions[0].run_uuid;
    if let Err(err) = ctx
        .monitor
        .qrep_run_started(&ctx.config.flow_job_name, run_uuid)
        .await
    {
        warn!(error = %err, "failed to record run start in catalog");
    }

    // Partitions are disjoint, so batches of them can run concurrently;
    // each partition is its own durable step.
    let workers = ctx.config.max_parallel_workers.max(1);
    for batch in partitions.chunks(workers) {
        let mut results = stream::iter(batch.iter().cloned())
            .map(|partition| {
                let ctx = ctx.clone();
                tokio::spawn(async move { qrep::replicate_partition(&ctx, &partition).await })
            })
            .buffer_unordered(workers);
        while let Some(joined) = results.next().await {
            match joined {
                Ok(result) => {
                    result?;
                }
                Err(err) => {
                    return Err(FlowError::Activity(
                        engine_core::error::ActivityError::Transient(format!(
                            "partition worker panicked: {err}"
                        )),
                    ));
                }
            }
        }
    }

    qrep::consolidate_partitions(ctx).await?;

    if let Err(err) = ctx
        .monitor
        .qrep_run_finished(&ctx.config.flow_job_name, run_uuid)
        .await
    {
        warn!(error = %err, "failed to record run finish in catalog");
    }

    info!(
        flow = %ctx.config.flow_job_name,
        run = %run_uuid,
        partitions = partitions.len(),
        "replication pass complete"
    );
    Ok(QRepPassSummary {
        partitions_processed: partitions.len() as u64,
        last_partition: partitions.last().cloned(),
    })
}

/// The long-running query-replication flow. Each pass persists its high
/// watermark before waiting for new rows, which is the history-truncation
/// point: a restarted flow reloads the snapshot and carries on.
pub async fn run_qrep_flow(
    ctx: &QRepContext,
    state_store: Arc<dyn FlowStateStore>,
) -> Result<(), FlowError> {
    qrep::setup_qrep_metadata(ctx).await?;

    let mut state = state_store
        .load_qrep_state(&ctx.config.flow_job_name)
        .await?
        .unwrap_or_else(|| QRepFlowState::initial(&ctx.config.flow_job_name));

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(FlowError::ShutdownRequested);
        }

        let summary = run_qrep_pass(ctx, state.last_partition.clone()).await?;
        state.num_partitions_processed += summary.partitions_processed;
        state.last_partition = summary.last_partition;
        state.updated_at = chrono::Utc::now();
        state_store.save_qrep_state(&state).await?;

        if ctx.config.initial_copy_only {
            // The run is complete and its watermark is persisted; the
            // partition sentinels have served their restart purpose.
            qrep::cleanup_qrep_flow(ctx).await?;
            info!(flow = %ctx.config.flow_job_name, "initial copy finished");
            return Ok(());
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(FlowError::ShutdownRequested),
            _ = tokio::time::sleep(Duration::from_secs(ctx.config.wait_between_batches_secs)) => {}
        }

        if let Some(last_partition) = &state.last_partition {
            qrep::wait_until_new_rows(ctx, last_partition, WATERMARK_POLL_INTERVAL).await?;
        }
    }
}
