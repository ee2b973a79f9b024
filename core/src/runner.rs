//! Single-flight execution of async operations.
//!
//! A [`Runner`] executes one operation at a time. Starting a new operation
//! aborts the previous one, and only the most recently *started* operation
//! may write the observable [`RunnerSnapshot`]. A generation counter is
//! compared under the control lock immediately before every state write.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{AbortHandle, Abortable};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use keystone_types::{Failure, codes};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

type ErrorMapper = dyn Fn(BoxError) -> Failure + Send + Sync;

/// Raised in place of a panic inside an operation.
#[derive(Debug, Error)]
#[error("operation panicked: {0}")]
pub struct PanicError(pub String);

/// How an `execute` call ended.
#[derive(Debug, Clone)]
pub enum Execution<T> {
    Settled(Result<T, Failure>),
    /// Superseded, reset, cancelled or dropped before settling.
    Cancelled,
}

impl<T> Execution<T> {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Cancellation becomes a network failure with code `cancelled`.
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Self::Settled(result) => result,
            Self::Cancelled => Err(Failure::cancelled()),
        }
    }
}

/// What observers see.
#[derive(Debug, Clone)]
pub struct RunnerSnapshot<T> {
    pub loading: bool,
    pub result: Option<Result<T, Failure>>,
}

impl<T> Default for RunnerSnapshot<T> {
    fn default() -> Self {
        Self {
            loading: false,
            result: None,
        }
    }
}

/// Cancels one specific run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    handle: AbortHandle,
    generation: u64,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone)]
pub enum OperationState<T> {
    Idle,
    Running(CancelHandle),
    Settled(Result<T, Failure>),
}

#[derive(Debug, Default)]
struct Control {
    generation: u64,
    active: Option<AbortHandle>,
}

struct Shared<T> {
    control: Mutex<Control>,
    state: watch::Sender<RunnerSnapshot<T>>,
    map_error: Box<ErrorMapper>,
}

impl<T> Shared<T> {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the next generation, aborting whatever was running.
    fn begin(&self, handle: AbortHandle) -> u64 {
        let mut control = self.control();
        control.generation = control.generation.wrapping_add(1);
        if let Some(previous) = control.active.replace(handle) {
            previous.abort();
        }
        self.state.send_modify(|snapshot| snapshot.loading = true);
        control.generation
    }

    /// Publish `result` if `generation` is still current.
    fn settle(&self, generation: u64, result: Result<T, Failure>) -> bool {
        let mut control = self.control();
        if control.generation != generation {
            return false;
        }
        control.active = None;
        self.state.send_replace(RunnerSnapshot {
            loading: false,
            result: Some(result),
        });
        true
    }

    /// The current run ended without a result.
    fn abandon(&self, generation: u64) {
        let mut control = self.control();
        if control.generation == generation {
            control.active = None;
            self.state.send_modify(|snapshot| snapshot.loading = false);
        }
    }

    /// Invalidate the current run so nothing it does becomes visible.
    fn interrupt(&self, clear_result: bool) {
        let mut control = self.control();
        control.generation = control.generation.wrapping_add(1);
        if let Some(active) = control.active.take() {
            active.abort();
        }
        self.state.send_modify(|snapshot| {
            snapshot.loading = false;
            if clear_result {
                snapshot.result = None;
            }
        });
    }

    fn map(&self, error: BoxError) -> Failure {
        match error.downcast::<Failure>() {
            Ok(failure) => *failure,
            Err(other) => (self.map_error)(other),
        }
    }
}

/// Resets `loading` if an `execute` future is dropped before it settles.
struct SettleGuard<T> {
    shared: Arc<Shared<T>>,
    generation: u64,
    armed: bool,
}

impl<T> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon(self.generation);
        }
    }
}

/// The default mapper: anything that is not a `Failure` is a network failure.
pub fn default_error_mapper(error: BoxError) -> Failure {
    let code = if error.is::<PanicError>() {
        codes::PANICKED
    } else {
        codes::UNEXPECTED
    };
    Failure::network(error.to_string())
        .with_code(code)
        .with_shared_cause(Arc::from(error))
}

/// Executes one async operation at a time; the latest start wins.
///
/// Dropping the runner aborts the in-flight operation.
pub struct Runner<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for Runner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.shared.control();
        f.debug_struct("Runner")
            .field("generation", &control.generation)
            .field("running", &control.active.is_some())
            .finish()
    }
}

impl<T> Runner<T> {
    /// Abort any pending run and clear the result. Does not set `loading`.
    pub fn reset(&self) {
        self.shared.interrupt(true);
    }

    /// Abort any pending run, keeping the last result.
    pub fn cancel(&self) {
        self.shared.interrupt(false);
    }
}

impl<T> Default for Runner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Runner<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_error_mapper(default_error_mapper)
    }

    /// Use `mapper` for errors (and panics) that are not already a `Failure`.
    pub fn with_error_mapper(mapper: impl Fn(BoxError) -> Failure + Send + Sync + 'static) -> Self {
        let (state, _) = watch::channel(RunnerSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control::default()),
                state,
                map_error: Box::new(mapper),
            }),
        }
    }

    /// Start `op`, superseding any run in progress.
    ///
    /// The run is registered (and `loading` set) when this is called, not
    /// when the returned future is first polled, so start order is call
    /// order.
    pub fn execute<F, E>(&self, op: F) -> impl Future<Output = Execution<T>> + Send + use<F, E, T>
    where
        F: Future<Output = Result<T, E>> + Send,
        E: Into<BoxError>,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let generation = self.shared.begin(handle);
        let mut guard = SettleGuard {
            shared: Arc::clone(&self.shared),
            generation,
            armed: true,
        };
        let task = Abortable::new(AssertUnwindSafe(op).catch_unwind(), registration);

        async move {
            let result = match task.await {
                // Superseded or cancelled: the guard clears `loading` if this
                // run is still the current one.
                Err(_aborted) => return Execution::Cancelled,
                Ok(Err(panic)) => {
                    let error: BoxError = Box::new(PanicError(panic_message(&*panic)));
                    Err(guard.shared.map(error))
                }
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(error))) => Err(guard.shared.map(error.into())),
            };

            guard.armed = false;
            if guard.shared.settle(guard.generation, result.clone()) {
                Execution::Settled(result)
            } else {
                Execution::Cancelled
            }
        }
    }

    /// Run `op` on the Tokio runtime.
    pub fn spawn<F, E>(&self, op: F) -> JoinHandle<Execution<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        tokio::spawn(self.execute(op))
    }

    #[must_use]
    pub fn state(&self) -> OperationState<T> {
        let control = self.shared.control();
        if let Some(handle) = &control.active {
            return OperationState::Running(CancelHandle {
                handle: handle.clone(),
                generation: control.generation,
            });
        }
        match &self.shared.state.borrow().result {
            Some(result) => OperationState::Settled(result.clone()),
            None => OperationState::Idle,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> RunnerSnapshot<T> {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn loading(&self) -> bool {
        self.shared.state.borrow().loading
    }

    #[must_use]
    pub fn result(&self) -> Option<Result<T, Failure>> {
        self.shared.state.borrow().result.clone()
    }

    /// Every state change publishes a whole snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunnerSnapshot<T>> {
        self.shared.state.subscribe()
    }
}

impl<T> Drop for Runner<T> {
    fn drop(&mut self) {
        let mut control = self.shared.control();
        control.generation = control.generation.wrapping_add(1);
        if let Some(active) = control.active.take() {
            active.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
