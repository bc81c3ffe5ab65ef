use connectors::registry::{DestinationConnector, SourceConnector};
use engine_core::activity::ActivityContext;
use model::flow::{FlowConnectionConfigs, QRepConfig};
use monitor::CatalogMonitor;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a CDC activity needs: the job config, both connectors, the
/// monitoring sink and the flow-level cancellation token.
#[derive(Clone)]
pub struct FlowContext {
    pub config: Arc<FlowConnectionConfigs>,
    pub source: Arc<SourceConnector>,
    pub destination: Arc<DestinationConnector>,
    pub monitor: Arc<dyn CatalogMonitor>,
    pub cancel: CancellationToken,
}

/// Per-run context for query replication; also used by the snapshot flow
/// with per-table configs.
#[derive(Clone)]
pub struct QRepContext {
    pub config: Arc<QRepConfig>,
    pub source: Arc<SourceConnector>,
    pub destination: Arc<DestinationConnector>,
    pub monitor: Arc<dyn CatalogMonitor>,
    pub cancel: CancellationToken,
}

/// Beats on the activity's behalf while a long call is in flight; aborted
/// when dropped.
pub struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub fn spawn_heartbeat(ctx: &ActivityContext, interval: Duration) -> HeartbeatGuard {
    let ctx = ctx.clone();
    HeartbeatGuard(tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            ctx.heartbeat();
        }
    }))
}
