//! Speculative mutations with rollback.
//!
//! The coordinator is always in one of two phases:
//!
//! - `Stable(result)`: the last confirmed (or rolled back) result
//! - `Optimistic { value, stable }`: a locally computed value shown until
//!   the confirming operation settles
//!
//! Observers receive whole [`OptimisticSnapshot`]s, so the exposed value is
//! always exactly the stable result or the optimistic value.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use keystone_types::Failure;

use crate::runner::{BoxError, Execution, Runner};

type Rollback<T> = dyn Fn(&T, &Failure) -> Result<T, Failure> + Send + Sync;

#[derive(Debug, Clone)]
enum Phase<T> {
    Stable(Result<T, Failure>),
    Optimistic { value: T, stable: Result<T, Failure> },
}

#[derive(Debug)]
struct Inner<T> {
    phase: Phase<T>,
    /// Most recent successful value; the updater's input when not optimistic.
    last_success: T,
}

#[derive(Debug, Clone)]
pub struct OptimisticSnapshot<T> {
    /// The stable result, or `Ok(optimistic value)`.
    pub result: Result<T, Failure>,
    pub is_optimistic: bool,
    pub loading: bool,
    /// Failure of the last confirming operation, kept after rollback.
    pub last_failure: Option<Failure>,
}

impl<T: Clone> OptimisticSnapshot<T> {
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }
}

pub struct OptimisticCoordinator<T> {
    runner: Runner<T>,
    inner: Mutex<Inner<T>>,
    rollback: Option<Box<Rollback<T>>>,
    state: watch::Sender<OptimisticSnapshot<T>>,
}

impl<T: fmt::Debug> fmt::Debug for OptimisticCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticCoordinator")
            .field("runner", &self.runner)
            .field("rollback", &self.rollback.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> OptimisticCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start stable at `Ok(initial)`.
    pub fn new(initial: T) -> Self {
        Self::with_runner(initial, Runner::new())
    }

    pub fn with_runner(initial: T, runner: Runner<T>) -> Self {
        let (state, _) = watch::channel(OptimisticSnapshot {
            result: Ok(initial.clone()),
            is_optimistic: false,
            loading: false,
            last_failure: None,
        });
        Self {
            runner,
            inner: Mutex::new(Inner {
                phase: Phase::Stable(Ok(initial.clone())),
                last_success: initial,
            }),
            rollback: None,
            state,
        }
    }

    /// Compute the stable value to show when a confirming operation fails
    /// while optimistic. Receives the optimistic value and the failure.
    pub fn with_rollback(
        mut self,
        rollback: impl Fn(&T, &Failure) -> Result<T, Failure> + Send + Sync + 'static,
    ) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    /// Show `updater(current)` immediately.
    ///
    /// `current` is the optimistic value if one is shown, else the last
    /// successful value. If the updater fails nothing changes and its
    /// failure is returned as is.
    pub fn apply_optimistic_update(
        &self,
        updater: impl FnOnce(&T) -> Result<T, Failure>,
    ) -> Result<(), Failure> {
        let mut inner = self.inner();
        let current = match &inner.phase {
            Phase::Optimistic { value, .. } => value,
            Phase::Stable(_) => &inner.last_success,
        };
        let value = updater(current)?;

        let stable = match &inner.phase {
            Phase::Optimistic { stable, .. } | Phase::Stable(stable) => stable.clone(),
        };
        inner.phase = Phase::Optimistic { value, stable };
        self.publish(&inner, None, self.runner.loading());
        Ok(())
    }

    /// Run the confirming operation through the runner.
    ///
    /// Success replaces everything with the server's value. Failure while
    /// optimistic rolls back (see [`with_rollback`](Self::with_rollback)),
    /// falling back to the last stable result. Failure while stable keeps
    /// the stable result and records the failure.
    pub async fn mutate<F, E>(&self, op: F) -> Execution<T>
    where
        F: Future<Output = Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        let mut in_flight = InFlight {
            coordinator: self,
            run: Some(Box::pin(self.runner.execute(op))),
        };
        {
            let inner = self.inner();
            let last_failure = self.state.borrow().last_failure.clone();
            self.publish(&inner, last_failure, true);
        }

        let outcome = match in_flight.run.as_mut() {
            Some(run) => run.await,
            None => Execution::Cancelled,
        };
        let Execution::Settled(result) = &outcome else {
            return outcome;
        };

        let mut inner = self.inner();
        let last_failure = match result {
            Ok(value) => {
                inner.last_success = value.clone();
                inner.phase = Phase::Stable(Ok(value.clone()));
                None
            }
            Err(failure) => {
                if let Phase::Optimistic { value, stable } = &inner.phase {
                    let restored = self.roll_back(value, stable, failure);
                    if let Ok(restored_value) = &restored {
                        inner.last_success = restored_value.clone();
                    }
                    inner.phase = Phase::Stable(restored);
                }
                Some(failure.clone())
            }
        };
        self.publish(&inner, last_failure, self.runner.loading());
        drop(inner);

        outcome
    }

    fn roll_back(&self, value: &T, stable: &Result<T, Failure>, failure: &Failure) -> Result<T, Failure> {
        let Some(rollback) = &self.rollback else {
            return stable.clone();
        };
        match rollback(value, failure) {
            Ok(restored) => Ok(restored),
            Err(rollback_failure) => {
                tracing::warn!(
                    error = %rollback_failure,
                    "Rollback failed; restoring last stable result"
                );
                stable.clone()
            }
        }
    }

    #[must_use]
    pub fn is_optimistic(&self) -> bool {
        matches!(self.inner().phase, Phase::Optimistic { .. })
    }

    #[must_use]
    pub fn snapshot(&self) -> OptimisticSnapshot<T> {
        let mut snapshot = self.state.borrow().clone();
        snapshot.loading = self.runner.loading();
        snapshot
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OptimisticSnapshot<T>> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn runner(&self) -> &Runner<T> {
        &self.runner
    }

    fn inner(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the published `loading` flag back in line with the runner.
    fn refresh_loading(&self) {
        let _inner = self.inner();
        let loading = self.runner.loading();
        self.state.send_if_modified(|snapshot| {
            let changed = snapshot.loading != loading;
            snapshot.loading = loading;
            changed
        });
    }

    /// Publish while the phase lock is held so snapshots follow phase order.
    fn publish(&self, inner: &Inner<T>, last_failure: Option<Failure>, loading: bool) {
        let (result, is_optimistic) = match &inner.phase {
            Phase::Stable(result) => (result.clone(), false),
            Phase::Optimistic { value, .. } => (Ok(value.clone()), true),
        };
        self.state.send_replace(OptimisticSnapshot {
            result,
            is_optimistic,
            loading,
            last_failure,
        });
    }
}

/// A `mutate` call between its start and its settlement.
///
/// Dropping it releases the pending run first (so the runner has cleared its
/// own `loading`), then re-publishes `loading`. This covers cancellation and
/// a `mutate` future dropped by `select!` or `timeout`.
struct InFlight<'a, T, R>
where
    T: Clone + Send + Sync + 'static,
{
    coordinator: &'a OptimisticCoordinator<T>,
    run: Option<Pin<Box<R>>>,
}

impl<T, R> Drop for InFlight<'_, T, R>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.run = None;
        self.coordinator.refresh_loading();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq)]
    struct Contact {
        name: String,
        archived: bool,
    }

    fn ada() -> Contact {
        Contact {
            name: "Ada".into(),
            archived: false,
        }
    }

    #[tokio::test]
    async fn optimistic_value_is_visible_before_confirmation() {
        let coordinator = OptimisticCoordinator::new(ada());
        let (confirm, confirmed) = oneshot::channel::<Contact>();

        coordinator
            .apply_optimistic_update(|c| {
                Ok(Contact {
                    archived: true,
                    ..c.clone()
                })
            })
            .unwrap();

        let snapshot = coordinator.snapshot();
        assert!(snapshot.is_optimistic);
        assert!(snapshot.value().unwrap().archived);

        let server = async move { confirmed.await.map_err(|_| Failure::network("dropped")) };
        let (outcome, ()) = tokio::join!(coordinator.mutate(server), async move {
            let _ = confirm.send(Contact {
                name: "Ada L.".into(),
                archived: true,
            });
        });

        assert_eq!(outcome.into_result().unwrap().name, "Ada L.");
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.is_optimistic);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.value().unwrap().name, "Ada L.");
    }

    #[tokio::test]
    async fn failure_rolls_back_to_prior_stable_value() {
        let coordinator = OptimisticCoordinator::new(ada());
        coordinator
            .apply_optimistic_update(|c| {
                Ok(Contact {
                    name: "Grace".into(),
                    ..c.clone()
                })
            })
            .unwrap();

        let outcome = coordinator
            .mutate(async { Err::<Contact, _>(Failure::business("name locked")) })
            .await;
        assert!(outcome.into_result().unwrap_err().is_business());

        let snapshot = coordinator.snapshot();
        assert!(!snapshot.is_optimistic);
        assert_eq!(snapshot.value(), Some(&ada()));
        assert!(snapshot.last_failure.unwrap().is_business());
    }

    #[tokio::test]
    async fn rollback_function_output_wins() {
        let coordinator = OptimisticCoordinator::new(ada()).with_rollback(|optimistic, failure| {
            Ok(Contact {
                name: format!("{} ({})", optimistic.name, failure.message),
                archived: false,
            })
        });
        coordinator
            .apply_optimistic_update(|c| {
                Ok(Contact {
                    name: "Grace".into(),
                    ..c.clone()
                })
            })
            .unwrap();

        let _ = coordinator
            .mutate(async { Err::<Contact, _>(Failure::network("offline")) })
            .await;

        let value = coordinator.snapshot().result.unwrap();
        assert_eq!(value.name, "Grace (offline)");
        assert!(!coordinator.is_optimistic());
    }

    #[tokio::test]
    async fn failing_rollback_restores_stable() {
        let coordinator = OptimisticCoordinator::new(ada())
            .with_rollback(|_, _| Err(Failure::validation("cannot rebuild")));
        coordinator
            .apply_optimistic_update(|_| {
                Ok(Contact {
                    name: "Grace".into(),
                    archived: true,
                })
            })
            .unwrap();

        let _ = coordinator
            .mutate(async { Err::<Contact, _>(Failure::network("offline")) })
            .await;
        assert_eq!(coordinator.snapshot().result.unwrap(), ada());
    }

    #[tokio::test]
    async fn failing_updater_leaves_state_untouched() {
        let coordinator = OptimisticCoordinator::new(ada());
        let err = coordinator
            .apply_optimistic_update(|_| Err(Failure::validation("name required")))
            .unwrap_err();

        assert!(err.is_validation());
        assert!(!coordinator.is_optimistic());
        assert_eq!(coordinator.snapshot().result.unwrap(), ada());
    }

    #[tokio::test]
    async fn chained_updates_build_on_optimistic_value() {
        let coordinator = OptimisticCoordinator::new(0_u32);
        coordinator.apply_optimistic_update(|n| Ok(n + 1)).unwrap();
        coordinator.apply_optimistic_update(|n| Ok(n + 1)).unwrap();
        assert_eq!(coordinator.snapshot().result.unwrap(), 2);

        let _ = coordinator
            .mutate(async { Err::<u32, _>(Failure::network("offline")) })
            .await;
        assert_eq!(coordinator.snapshot().result.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_while_stable_keeps_value() {
        let coordinator = OptimisticCoordinator::new(5_u32);
        let _ = coordinator
            .mutate(async { Err::<u32, _>(Failure::auth("expired")) })
            .await;

        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.result.unwrap(), 5);
        assert!(snapshot.last_failure.unwrap().is_auth());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_mutation_does_not_settle() {
        let coordinator = OptimisticCoordinator::new(0_u32);
        coordinator.apply_optimistic_update(|_| Ok(10)).unwrap();

        let first = coordinator.mutate(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Failure>(1)
        });
        let second = coordinator.mutate(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, Failure>(2)
        });

        let (first, second) = tokio::join!(first, second);
        assert!(first.is_cancelled());
        assert_eq!(second.into_result().unwrap(), 2);
        assert_eq!(coordinator.snapshot().result.unwrap(), 2);
        assert!(!coordinator.subscribe().borrow().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_mutation_clears_published_loading() {
        let coordinator = OptimisticCoordinator::new(0_u32);
        let mut updates = coordinator.subscribe();
        coordinator.apply_optimistic_update(|n| Ok(n + 1)).unwrap();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.mutate(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Failure>(5)
            }),
        )
        .await;
        assert!(timed_out.is_err());

        assert!(updates.has_changed().unwrap());
        let seen = updates.borrow_and_update().clone();
        assert!(!seen.loading);
        assert!(seen.is_optimistic);
        assert_eq!(seen.result.unwrap(), 1);
        assert!(!coordinator.runner().loading());
        assert!(!coordinator.snapshot().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_mutation_clears_published_loading() {
        let coordinator = OptimisticCoordinator::new(0_u32);
        let updates = coordinator.subscribe();

        let pending = coordinator.mutate(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Failure>(5)
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(updates.borrow().loading);
            coordinator.runner().cancel();
        };

        let (outcome, ()) = tokio::join!(pending, cancel);
        assert!(outcome.is_cancelled());
        assert!(!updates.borrow().loading);
        assert_eq!(coordinator.snapshot().result.unwrap(), 0);
    }
}
