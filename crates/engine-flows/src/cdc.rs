use crate::{error::FlowError, snapshot::run_snapshot_flow};
use engine_activities::{cdc, context::FlowContext, setup};
use engine_core::{
    control::{FlowControl, NormalizeStatus},
    error::ActivityError,
    state::{FlowStateStore, models::CdcFlowState},
};
use std::sync::Arc;
use tracing::{info, warn};

/// Empty pulls in a row before a keepalive write goes to the source WAL.
const EMPTY_PULLS_BEFORE_HEARTBEAT: u32 = 3;

/// The long-running CDC mirror for one job.
///
/// State machine: SETUP (idempotent peer preparation, optional snapshot)
/// → RUNNING (pull→sync→normalize loop, history truncated every
/// `sync_flow_loop_count` iterations by persisting a state snapshot)
/// → SHUTDOWN (cleanup on signal). Activities are strictly sequential:
/// a pull never starts before the previous sync+normalize committed.
pub struct CdcFlow {
    ctx: FlowContext,
    state_store: Arc<dyn FlowStateStore>,
    control: Arc<FlowControl>,
}

impl CdcFlow {
    pub fn new(
        ctx: FlowContext,
        state_store: Arc<dyn FlowStateStore>,
        control: Arc<FlowControl>,
    ) -> Self {
        Self {
            ctx,
            state_store,
            control,
        }
    }

    pub async fn run(&self) -> Result<(), FlowError> {
        let job = &self.ctx.config.flow_job_name;
        let mut state = self
            .state_store
            .load_cdc_state(job)
            .await?
            .unwrap_or_else(|| CdcFlowState::initial(job));

        if !state.setup_complete {
            match self.run_setup().await {
                Ok(()) => {
                    state.setup_complete = true;
                    state.updated_at = chrono::Utc::now();
                    self.state_store.save_cdc_state(&state).await?;
                }
                Err(err) => {
                    self.record_error(&err).await;
                    return Err(err);
                }
            }
        }
        self.control
            .update_status(|s| s.setup_complete = true)
            .await;
        info!(flow = %job, "entering running state");

        loop {
            match self.run_generation(&mut state).await {
                Ok(()) => {
                    // History truncation point: persist, then start a fresh
                    // generation with nothing carried in memory.
                    state.iteration += 1;
                    state.updated_at = chrono::Utc::now();
                    self.state_store.save_cdc_state(&state).await?;
                    info!(flow = %job, generation = state.iteration, "continuing as new");
                }
                Err(err) if err.is_shutdown() => {
                    info!(flow = %job, "shutdown requested, cleaning up");
                    return self.shutdown().await;
                }
                Err(err) => {
                    self.record_error(&err).await;
                    return Err(err);
                }
            }
        }
    }

    /// Idempotent peer preparation plus the optional initial copy. Also
    /// runnable on its own by the snapshot worker.
    pub async fn run_setup(&self) -> Result<(), FlowError> {
        let ctx = &self.ctx;
        setup::check_connections(ctx).await?;
        setup::setup_metadata_tables(ctx).await?;
        setup::ensure_pullability(ctx).await?;
        let replication = setup::setup_replication(ctx).await?;
        setup::create_raw_table(ctx).await?;
        setup::setup_normalized_tables(ctx).await?;

        if ctx.config.do_initial_copy {
            let snapshot_name = replication.snapshot_name.clone().ok_or_else(|| {
                ActivityError::Precondition(
                    "initial copy requested but replication setup surfaced no snapshot".into(),
                )
            })?;
            run_snapshot_flow(ctx, &snapshot_name, replication.consistent_point).await?;
            // The exporting transaction can close once every table is
            // copied; CDC now replays from the consistent point.
            let connectors::registry::SourceConnector::Postgres(source) = ctx.source.as_ref();
            if let Err(err) = source.release_snapshot().await {
                warn!(error = %err, "failed to release snapshot session");
            }
        }
        Ok(())
    }

    /// One bounded run of the pull loop; returning `Ok` means the caller
    /// should continue-as-new.
    async fn run_generation(&self, state: &mut CdcFlowState) -> Result<(), FlowError> {
        let ctx = &self.ctx;
        let mut empty_pulls: u32 = 0;

        for _ in 0..ctx.config.sync_flow_loop_count.max(1) {
            if ctx.cancel.is_cancelled() || self.control.is_shutdown_requested() {
                return Err(FlowError::ShutdownRequested);
            }

            let output = cdc::start_flow(ctx).await?;

            if !output.schema_deltas.is_empty() {
                cdc::replay_schema_deltas(ctx, &output.schema_deltas).await?;
            }

            match output.sync_response {
                Some(response) if response.num_records_synced > 0 => {
                    empty_pulls = 0;
                    state.last_offset = response.last_synced_checkpoint;
                    state.sync_batch_id = response.current_sync_batch_id;

                    let normalize = match cdc::start_normalize(ctx).await {
                        Ok(normalize) => normalize,
                        Err(err) if err.is_unsupported() => {
                            // Destination has no normalize stage; raw rows
                            // are the terminal shape there.
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                    state.normalize_batch_id = normalize.end_batch_id;
                    self.control
                        .update_status(|s| {
                            s.normalize_flow_statuses.push(NormalizeStatus {
                                start_batch_id: normalize.start_batch_id,
                                end_batch_id: normalize.end_batch_id,
                                tables_affected: response.table_name_rows_mapping.len() as u64,
                            })
                        })
                        .await;
                }
                _ => {
                    empty_pulls += 1;
                    if empty_pulls >= EMPTY_PULLS_BEFORE_HEARTBEAT {
                        empty_pulls = 0;
                        cdc::send_wal_heartbeat(ctx).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), FlowError> {
        let result = cdc::drop_flow(&self.ctx).await;
        self.state_store
            .delete_flow_state(&self.ctx.config.flow_job_name)
            .await?;
        result?;
        Ok(())
    }

    async fn record_error(&self, err: &FlowError) {
        warn!(flow = %self.ctx.config.flow_job_name, error = %err, "flow paused on error");
        let message = err.to_string();
        self.control
            .update_status(move |s| s.error_message = Some(message))
            .await;
    }
}
