//! Attempt/backoff loop for arbitrary fallible operations.
//!
//! Shares [`RetryPolicy`] and [`RetrySchedule`] with the fetcher, so the
//! attempt numbering and the backoff curve are identical.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use keystone_fetch::{RetryPolicy, RetrySchedule};
use keystone_types::{Failure, RetryContext};

use crate::runner::{Execution, Runner};

type Transform<T, U> = dyn Fn(T) -> Result<U, Failure> + Send + Sync;
type ErrorHook = dyn Fn(&Failure) + Send + Sync;
type SuccessHook<U> = dyn Fn(&U) + Send + Sync;

/// Retries an operation while its failures are `retryable`.
///
/// The operation receives the [`RetryContext`] of the attempt it is about
/// to make (`retryable` reflects whether a failure would be retried).
pub struct RetryableOperation<T, U = T> {
    policy: RetryPolicy,
    transform: Arc<Transform<T, U>>,
    on_error: Option<Arc<ErrorHook>>,
    on_success: Option<Arc<SuccessHook<U>>>,
}

impl<T, U> Clone for RetryableOperation<T, U> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            transform: Arc::clone(&self.transform),
            on_error: self.on_error.clone(),
            on_success: self.on_success.clone(),
        }
    }
}

impl<T, U> fmt::Debug for RetryableOperation<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryableOperation")
            .field("policy", &self.policy)
            .field("on_error", &self.on_error.is_some())
            .field("on_success", &self.on_success.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> RetryableOperation<T, T>
where
    T: Send + 'static,
{
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_transform(policy, Ok)
    }
}

impl<T, U> RetryableOperation<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// `transform` runs after a successful attempt only; its failure is final.
    pub fn with_transform(
        policy: RetryPolicy,
        transform: impl Fn(T) -> Result<U, Failure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            policy,
            transform: Arc::new(transform),
            on_error: None,
            on_success: None,
        }
    }

    /// Called with every failed attempt, after retry metadata is attached.
    #[must_use]
    pub fn on_error(mut self, hook: impl Fn(&Failure) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_success(mut self, hook: impl Fn(&U) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<F, Fut>(&self, mut op: F) -> Result<U, Failure>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut schedule = RetrySchedule::new(&self.policy);

        loop {
            let context = schedule.context(schedule.can_retry());
            match op(context).await {
                Ok(value) => {
                    schedule.succeed();
                    return match (self.transform)(value) {
                        Ok(output) => {
                            if let Some(hook) = &self.on_success {
                                hook(&output);
                            }
                            Ok(output)
                        }
                        Err(failure) => {
                            let failure = if failure.retry.is_some() {
                                failure
                            } else {
                                failure.with_retry(schedule.context(false))
                            };
                            self.report(&failure);
                            Err(failure)
                        }
                    };
                }
                Err(failure) => {
                    let retry = failure.retryable && schedule.can_retry();
                    let failure = failure.with_retry(schedule.context(retry));
                    self.report(&failure);

                    if !retry {
                        schedule.fail();
                        return Err(failure);
                    }

                    let attempt = schedule.attempt();
                    let delay = schedule.schedule_retry(None);
                    tracing::debug!(
                        code = failure.code.as_deref().unwrap_or_default(),
                        status = ?failure.status_code,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying failed operation"
                    );
                    schedule.wait().await;
                }
            }
        }
    }

    /// Run through `runner`, so the whole retry loop is single-flight and
    /// cancelable.
    pub fn run_on<F, Fut>(
        &self,
        runner: &Runner<U>,
        op: F,
    ) -> impl Future<Output = Execution<U>> + Send + use<F, Fut, T, U>
    where
        U: Clone + Sync,
        F: FnMut(RetryContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Failure>> + Send,
    {
        let this = self.clone();
        runner.execute(async move { this.run(op).await })
    }

    fn report(&self, failure: &Failure) {
        if let Some(hook) = &self.on_error {
            hook(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn policy(max_retries: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(delay_ms),
            ..RetryPolicy::default()
        }
    }

    fn transient() -> Failure {
        Failure::network("service unavailable")
            .with_status(503)
            .with_retryable(true)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let operation = RetryableOperation::new(policy(3, 100));

        let result = operation
            .run(|context| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(context.attempt, n);
                async move { if n < 2 { Err(transient()) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_final_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let operation = RetryableOperation::<u32>::new(policy(2, 10))
            .on_error(move |f| recorded.lock().unwrap().push(f.retry.unwrap()));

        let failure = operation.run(|_| async { Err(transient()) }).await.unwrap_err();

        let retry = failure.retry.unwrap();
        assert_eq!((retry.attempt, retry.max_retries, retry.retryable), (2, 2, false));
        assert!(!failure.retryable);

        let seen = seen.lock().unwrap();
        let flags: Vec<_> = seen.iter().map(|c| (c.attempt, c.retryable)).collect();
        assert_eq!(flags, vec![(0, true), (1, true), (2, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let starts = Mutex::new(Vec::new());
        let operation = RetryableOperation::<()>::new(policy(3, 100));

        let _ = operation
            .run(|_| {
                starts.lock().unwrap().push(Instant::now());
                async { Err(transient()) }
            })
            .await;

        let starts = starts.into_inner().unwrap();
        let gaps: Vec<_> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_is_final() {
        let calls = AtomicU32::new(0);
        let operation = RetryableOperation::<u32>::new(policy(5, 10));

        let failure = operation
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure::validation("email is required")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(failure.is_validation());
        assert_eq!(failure.attempt(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_retries_make_one_attempt() {
        let calls = AtomicU32::new(0);
        let operation = RetryableOperation::<u32>::new(RetryPolicy {
            retry_on_transient_error: false,
            ..policy(3, 10)
        });

        let _ = operation
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transform_applies_to_success_only() {
        let successes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&successes);
        let operation = RetryableOperation::with_transform(policy(0, 10), |n: u32| Ok(n.to_string()))
            .on_success(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert_eq!(operation.run(|_| async { Ok(7) }).await.unwrap(), "7");
        assert_eq!(successes.load(Ordering::SeqCst), 1);

        let failure = operation
            .run(|_| async { Err(Failure::auth("token expired")) })
            .await
            .unwrap_err();
        assert!(failure.is_auth());
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_transform_carries_retry_context() {
        let operation = RetryableOperation::with_transform(policy(2, 10), |_: u32| {
            Err::<u32, _>(Failure::validation("negative balance"))
        });

        let failure = operation.run(|_| async { Ok(1) }).await.unwrap_err();
        assert!(failure.is_validation());
        assert_eq!(failure.retry.map(|c| c.retryable), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn run_on_runner_is_cancelable() {
        let runner = Runner::<u32>::new();
        let operation = RetryableOperation::<u32>::new(policy(10, 1000));

        let pending = operation.run_on(&runner, |_| async { Err(transient()) });
        assert!(runner.loading());

        let settled = operation.run_on(&runner, |_| async { Ok(9) });
        let (pending, settled) = tokio::join!(pending, settled);

        assert!(pending.is_cancelled());
        assert_eq!(settled.into_result().unwrap(), 9);
        assert_eq!(runner.result().unwrap().unwrap(), 9);
    }
}
