use crate::error::ActivityError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Backoff schedule for durable steps.
///
/// The decision to retry is not pluggable: it follows the activity error
/// taxonomy directly, so every layer agrees on what is worth another
/// attempt. Transient connectivity trouble and lost-heartbeat reschedules
/// back off and retry; corrupt input, precondition failures, missing
/// capabilities and cancellation stop on first occurrence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_activity()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Preset for whole durable steps; spaced out because each attempt may
    /// redo minutes of pull or merge work.
    pub fn for_activity() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Runs the operation until it succeeds, fails terminally, or the
    /// attempt budget is spent. The error of the final attempt is returned
    /// unchanged so callers can still branch on its kind.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ActivityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_before(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step failed, backing off before retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delay after the given attempt: doubles from the base, saturating at
    /// the cap.
    fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn immediate(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    async fn count_attempts(
        policy: RetryPolicy,
        errors: impl Fn(u32) -> Option<ActivityError> + Send + Sync + 'static,
    ) -> (Result<u32, ActivityError>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = calls.clone();
        let result = policy
            .run(move || {
                let op_calls = op_calls.clone();
                let err = errors(op_calls.fetch_add(1, Ordering::SeqCst));
                async move {
                    match err {
                        Some(err) => Err(err),
                        None => Ok(7),
                    }
                }
            })
            .await;
        let total = calls.load(Ordering::SeqCst);
        (result, total)
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let (result, attempts) = count_attempts(immediate(5), |call| {
            (call < 2).then(|| ActivityError::Transient("connection reset".into()))
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn lost_heartbeats_are_rescheduled() {
        let (result, attempts) = count_attempts(immediate(3), |call| {
            (call == 0).then(|| ActivityError::Lost("no beats".into()))
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn precondition_failures_stop_on_first_attempt() {
        let (result, attempts) = count_attempts(immediate(5), |_| {
            Some(ActivityError::Precondition("schema drift".into()))
        })
        .await;
        assert!(matches!(result, Err(ActivityError::Precondition(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn missing_capabilities_are_not_retried() {
        let (result, attempts) = count_attempts(immediate(5), |_| {
            Some(ActivityError::Unsupported("cdc normalize".into()))
        })
        .await;
        assert!(result.unwrap_err().is_unsupported());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_final_transient_error() {
        let (result, attempts) = count_attempts(immediate(3), |call| {
            Some(ActivityError::Transient(format!("attempt {call} failed")))
        })
        .await;
        match result {
            Err(ActivityError::Transient(message)) => {
                assert_eq!(message, "attempt 2 failed");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn backoff_doubles_and_saturates_at_the_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(2));
        assert_eq!(policy.delay_before(1), Duration::from_millis(250));
        assert_eq!(policy.delay_before(2), Duration::from_millis(500));
        assert_eq!(policy.delay_before(3), Duration::from_secs(1));
        assert_eq!(policy.delay_before(4), Duration::from_secs(2));
        assert_eq!(policy.delay_before(9), Duration::from_secs(2));
    }
}
