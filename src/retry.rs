use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{exponential_delay, with_jitter},
    clock::run_bounded,
    OperationClock, Result, RpcError,
};

/// Predicate deciding whether a failure is worth another attempt.
pub type TransientClassifier = Arc<dyn Fn(&RpcError) -> bool + Send + Sync>;

/// Bounded retry behavior for one call site.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay: Duration,
    /// Upper bound of the doubled delay, before jitter.
    pub max_delay: Duration,
    /// Half-width of the uniform jitter added to every delay.
    pub jitter: Duration,
    classifier: TransientClassifier,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("classifier", &"<fn>")
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(200),
            classifier: Arc::new(RpcError::is_transient),
        }
    }
}

impl RetryPolicy {
    /// Default policy with `max_attempts` total attempts (raised to 1 if 0).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Sets base and cap of the exponential delay.
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Sets the jitter half-width.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the transient classifier.
    ///
    /// The default is [`RpcError::is_transient`].
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&RpcError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Whether `err` is retryable under this policy.
    pub fn is_transient(&self, err: &RpcError) -> bool {
        (self.classifier)(err)
    }

    /// Delay before jitter that follows the failed `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.base_delay, attempt, self.max_delay)
    }
}

/// What a single attempt gets to work with.
#[derive(Clone, Debug)]
pub struct CallContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Timeout resolved for this attempt.
    pub timeout: Duration,
    /// Instant at which the attempt is abandoned.
    pub deadline: Instant,
    /// Cancelled when the attempt ends for any reason.
    pub cancel: CancellationToken,
}

/// Runs remote calls under a [`RetryPolicy`].
///
/// Attempts are strictly sequential. Every attempt is bounded by the timeout
/// the executor's [`OperationClock`] resolves and by the caller's
/// cancellation token.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryExecutor {
    clock: OperationClock,
}

impl RetryExecutor {
    /// Creates an executor bounding each attempt with `clock`.
    pub fn new(clock: OperationClock) -> Self {
        Self { clock }
    }

    /// Returns the clock used for per-attempt deadlines.
    pub fn clock(&self) -> &OperationClock {
        &self.clock
    }

    /// Executes `call`, retrying transient failures.
    ///
    /// Cancellation (the caller's token or the per-attempt deadline) and
    /// non-transient errors end the run at once. When the attempts run out
    /// the last error is returned unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(CallContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RpcError::Cancelled);
            }

            let timeout = self.clock.resolve_timeout();
            let context = CallContext {
                attempt,
                timeout,
                deadline: Instant::now() + timeout,
                cancel: cancel.child_token(),
            };
            let scope = context.cancel.clone();
            let err = match run_bounded(timeout, cancel, scope, call(context)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancellation() || !policy.is_transient(&err) {
                return Err(err);
            }

            if attempt >= max_attempts {
                #[cfg(feature = "tracing")]
                tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let wait = with_jitter(policy.backoff_delay(attempt), policy.jitter);

            #[cfg(feature = "tracing")]
            tracing::warn!(
                attempt,
                remaining = max_attempts - attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = sleep(wait) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{RetryExecutor, RetryPolicy};
    use crate::{OperationClock, RpcError, StatusCode};

    fn unavailable() -> RpcError {
        RpcError::remote(StatusCode::Unavailable, "terminal offline")
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_delays(Duration::from_millis(10), Duration::from_millis(50))
            .with_jitter(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_makes_exactly_max_attempts() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let mut attempts = 0u32;

        let err = executor
            .execute(&fast_policy(5), &cancel, |_| {
                attempts += 1;
                async { Err::<(), _>(unavailable()) }
            })
            .await
            .expect_err("must give up");

        assert_eq!(attempts, 5);
        assert_eq!(err, unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failure_is_not_retried() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let mut attempts = 0u32;

        let err = executor
            .execute(&fast_policy(5), &cancel, |_| {
                attempts += 1;
                async { Err::<(), _>(RpcError::remote(StatusCode::InvalidArgument, "bad volume")) }
            })
            .await
            .expect_err("must fail");

        assert_eq!(attempts, 1);
        assert_eq!(err.code(), Some(StatusCode::InvalidArgument));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_attempt_never_calls() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut attempts = 0u32;

        let err = executor
            .execute(&fast_policy(3), &cancel, |_| {
                attempts += 1;
                async { Ok::<_, RpcError>(1) }
            })
            .await
            .expect_err("must be cancelled");

        assert_eq!(attempts, 0);
        assert_eq!(err, RpcError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_three_transient_failures_with_growing_waits() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let policy =
            RetryPolicy::new(4).with_delays(Duration::from_millis(400), Duration::from_secs(10));
        let mut starts = Vec::new();

        let value = executor
            .execute(&policy, &cancel, |ctx| {
                starts.push(Instant::now());
                async move {
                    if ctx.attempt < 4 {
                        Err(unavailable())
                    } else {
                        Ok(ctx.attempt)
                    }
                }
            })
            .await
            .expect("fourth attempt must succeed");

        assert_eq!(value, 4);
        assert_eq!(starts.len(), 4);
        let expected = [400u64, 800, 1_600];
        for (gap, base) in starts.windows(2).zip(expected) {
            let waited = gap[1].duration_since(gap[0]).as_millis() as u64;
            assert!(
                waited + 200 >= base && waited <= base + 200,
                "waited {waited} ms, expected {base} ms +/- 200"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_deadline_comes_from_clock_and_is_not_retried() {
        let clock = OperationClock::default().with_override(Duration::from_millis(300));
        let executor = RetryExecutor::new(clock);
        let cancel = CancellationToken::new();
        let mut attempts = 0u32;

        let err = executor
            .execute(&fast_policy(3), &cancel, |ctx| {
                attempts += 1;
                assert_eq!(ctx.timeout, Duration::from_millis(300));
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, RpcError>(())
                }
            })
            .await
            .expect_err("attempt must time out");

        assert_eq!(attempts, 1);
        assert_eq!(err, RpcError::Timeout(Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let policy =
            RetryPolicy::new(5).with_delays(Duration::from_secs(2), Duration::from_secs(10));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let mut attempts = 0u32;

        let err = executor
            .execute(&policy, &cancel, |_| {
                attempts += 1;
                async { Err::<(), _>(unavailable()) }
            })
            .await
            .expect_err("must be cancelled");

        assert_eq!(attempts, 1);
        assert_eq!(err, RpcError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_widens_transient_set() {
        let executor = RetryExecutor::default();
        let cancel = CancellationToken::new();
        let policy = fast_policy(3)
            .with_classifier(|err| err.is_transient() || err.code() == Some(StatusCode::Aborted));
        let mut attempts = 0u32;

        let value = executor
            .execute(&policy, &cancel, |ctx| {
                attempts += 1;
                async move {
                    if ctx.attempt == 1 {
                        Err(RpcError::remote(StatusCode::Aborted, "requote"))
                    } else {
                        Ok("filled")
                    }
                }
            })
            .await
            .expect("second attempt must succeed");

        assert_eq!(value, "filled");
        assert_eq!(attempts, 2);
    }

    #[test]
    fn zero_attempts_is_raised_to_one() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
