use crate::{error::ActivityError, retry::RetryPolicy};
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Missed-beat allowance before an attempt is declared lost.
const MISSED_BEATS_BEFORE_LOST: u32 = 3;

#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub name: &'static str,
    /// How often the activity is expected to beat. Zero disables the
    /// watchdog (for short steps that finish within one retry window).
    pub heartbeat_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            heartbeat_timeout: Duration::ZERO,
            retry: RetryPolicy::for_activity(),
        }
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Handle given to each activity attempt: report liveness, observe
/// cancellation.
#[derive(Clone)]
pub struct ActivityContext {
    cancel: CancellationToken,
    last_beat: Arc<Mutex<Instant>>,
}

impl ActivityContext {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            last_beat: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn heartbeat(&self) {
        *self.last_beat.lock().expect("heartbeat clock poisoned") = Instant::now();
    }

    fn beat_age(&self) -> Duration {
        self.last_beat
            .lock()
            .expect("heartbeat clock poisoned")
            .elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

async fn watchdog(ctx: ActivityContext, timeout: Duration) {
    let allowance = timeout * MISSED_BEATS_BEFORE_LOST;
    loop {
        tokio::time::sleep(timeout).await;
        if ctx.beat_age() > allowance {
            return;
        }
    }
}

/// Runs one durable step: retried with backoff on retryable failures,
/// aborted and rescheduled when heartbeats stop, cancelled cleanly when the
/// flow shuts down. All side effects live inside `op`; the caller's state
/// advances only on `Ok`.
pub async fn execute_activity<T, F, Fut>(
    opts: &ActivityOptions,
    cancel: &CancellationToken,
    op: F,
) -> Result<T, ActivityError>
where
    F: Fn(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    match opts.retry.run(|| run_attempt(opts, cancel, &op)).await {
        Ok(value) => Ok(value),
        Err(err) => {
            // A retryable kind surviving the policy means the budget ran out.
            if err.is_retryable() {
                warn!(activity = opts.name, error = %err, "activity retries exhausted");
            }
            Err(err)
        }
    }
}

async fn run_attempt<T, F, Fut>(
    opts: &ActivityOptions,
    cancel: &CancellationToken,
    op: &F,
) -> Result<T, ActivityError>
where
    F: Fn(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    if cancel.is_cancelled() {
        return Err(ActivityError::Cancelled);
    }
    let ctx = ActivityContext::new(cancel.child_token());
    debug!(activity = opts.name, "starting activity attempt");

    if opts.heartbeat_timeout.is_zero() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ActivityError::Cancelled),
            result = op(ctx.clone()) => result,
        }
    } else {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ActivityError::Cancelled),
            _ = watchdog(ctx.clone(), opts.heartbeat_timeout) => {
                warn!(activity = opts.name, "activity missed heartbeats, rescheduling");
                Err(ActivityError::Lost(format!(
                    "{} missed {MISSED_BEATS_BEFORE_LOST} heartbeats",
                    opts.name
                )))
            }
            result = op(ctx.clone()) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn beating_activity_completes() {
        let opts = ActivityOptions::new("beating")
            .with_heartbeat(Duration::from_millis(20))
            .with_retry(RetryPolicy::new(1, Duration::ZERO, Duration::ZERO));
        let cancel = CancellationToken::new();

        let result = execute_activity(&opts, &cancel, |ctx| async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.heartbeat();
            }
            Ok::<_, ActivityError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn silent_activity_is_lost_and_rescheduled() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let opts = ActivityOptions::new("silent")
            .with_heartbeat(Duration::from_millis(10))
            .with_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO));
        let cancel = CancellationToken::new();

        let op_attempts = attempts.clone();
        let result = execute_activity(&opts, &cancel, move |_ctx| {
            let op_attempts = op_attempts.clone();
            async move {
                op_attempts.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ActivityError>(())
            }
        })
        .await;

        assert!(matches!(result, Err(ActivityError::Lost(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_without_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let opts = ActivityOptions::new("cancelled")
            .with_retry(RetryPolicy::new(5, Duration::ZERO, Duration::ZERO));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let op_attempts = attempts.clone();
        let result = execute_activity(&opts, &cancel, move |_ctx| {
            let op_attempts = op_attempts.clone();
            async move {
                op_attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ActivityError>(())
            }
        })
        .await;

        assert!(matches!(result, Err(ActivityError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn precondition_failures_do_not_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let opts = ActivityOptions::new("precondition")
            .with_retry(RetryPolicy::new(5, Duration::ZERO, Duration::ZERO));
        let cancel = CancellationToken::new();

        let op_attempts = attempts.clone();
        let result: Result<(), _> = execute_activity(&opts, &cancel, move |_ctx| {
            let op_attempts = op_attempts.clone();
            async move {
                op_attempts.fetch_add(1, Ordering::SeqCst);
                Err(ActivityError::Precondition("schema drift".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ActivityError::Precondition(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
