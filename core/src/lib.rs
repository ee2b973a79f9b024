//! Async data-access primitives for Keystone.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`runner`] | Single-flight, cancelable execution with observable state |
//! | [`optimistic`] | Speculative values shown until a mutation confirms or rolls back |
//! | [`retry`] | The fetcher's attempt/backoff loop for any fallible operation |
//! | [`query`] | A request bound to a runner, the shared cache and focus revalidation |
//!
//! Every boundary converts unexpected errors (and panics) into a typed
//! [`Failure`](keystone_types::Failure) before it becomes observable.

pub mod optimistic;
pub mod query;
pub mod retry;
pub mod runner;

pub use optimistic::{OptimisticCoordinator, OptimisticSnapshot};
pub use query::{Query, QueryBuilder, QuerySnapshot};
pub use retry::RetryableOperation;
pub use runner::{
    BoxError, CancelHandle, Execution, OperationState, PanicError, Runner, RunnerSnapshot,
    default_error_mapper,
};
