use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock, watch};

/// Status exposed by a running CDC flow in response to a status query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CdcFlowStatus {
    pub setup_complete: bool,
    pub normalize_flow_statuses: Vec<NormalizeStatus>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizeStatus {
    pub start_batch_id: i64,
    pub end_batch_id: i64,
    pub tables_affected: u64,
}

/// Per-flow control surface: a shutdown signal and a queryable status
/// snapshot. This is the signal/query seam a durable workflow engine would
/// provide; here it is process-local.
pub struct FlowControl {
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<CdcFlowStatus>,
}

impl FlowControl {
    fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            status: RwLock::new(CdcFlowStatus::default()),
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub async fn set_status(&self, status: CdcFlowStatus) {
        *self.status.write().await = status;
    }

    pub async fn update_status<F: FnOnce(&mut CdcFlowStatus)>(&self, f: F) {
        f(&mut *self.status.write().await);
    }

    pub async fn status(&self) -> CdcFlowStatus {
        self.status.read().await.clone()
    }
}

/// Registry of live flows, keyed by job name. The control API resolves
/// signals and queries through this.
#[derive(Clone, Default)]
pub struct ControlHub {
    flows: Arc<Mutex<HashMap<String, Arc<FlowControl>>>>,
}

impl ControlHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or reuses) the control surface for a job.
    pub async fn register(&self, job_name: &str) -> Arc<FlowControl> {
        let mut flows = self.flows.lock().await;
        flows
            .entry(job_name.to_string())
            .or_insert_with(|| Arc::new(FlowControl::new()))
            .clone()
    }

    pub async fn get(&self, job_name: &str) -> Option<Arc<FlowControl>> {
        self.flows.lock().await.get(job_name).cloned()
    }

    /// Delivers a shutdown signal. Returns false when the job is unknown.
    pub async fn signal_shutdown(&self, job_name: &str) -> bool {
        match self.get(job_name).await {
            Some(control) => {
                control.signal_shutdown();
                true
            }
            None => false,
        }
    }

    pub async fn query_status(&self, job_name: &str) -> Option<CdcFlowStatus> {
        match self.get(job_name).await {
            Some(control) => Some(control.status().await),
            None => None,
        }
    }

    pub async fn deregister(&self, job_name: &str) {
        self.flows.lock().await.remove(job_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_reaches_subscribers() {
        let hub = ControlHub::new();
        let control = hub.register("job").await;
        let mut rx = control.shutdown_receiver();
        assert!(!*rx.borrow());

        assert!(hub.signal_shutdown("job").await);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn unknown_jobs_reject_signals() {
        let hub = ControlHub::new();
        assert!(!hub.signal_shutdown("missing").await);
        assert!(hub.query_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn status_query_sees_updates() {
        let hub = ControlHub::new();
        let control = hub.register("job").await;
        control
            .update_status(|s| {
                s.setup_complete = true;
                s.normalize_flow_statuses.push(NormalizeStatus {
                    start_batch_id: 1,
                    end_batch_id: 3,
                    tables_affected: 2,
                });
            })
            .await;

        let status = hub.query_status("job").await.unwrap();
        assert!(status.setup_complete);
        assert_eq!(status.normalize_flow_statuses.len(), 1);
    }
}
