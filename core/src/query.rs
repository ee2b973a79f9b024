//! Cached, cancelable reads bound to a single request.

use std::any::TypeId;
use std::fmt;
use std::future::{Future, ready};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{AbortHandle, Abortable};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use keystone_cache::{CachePolicy, FocusSignal, ResultCache};
use keystone_fetch::{FetchOptions, FetchRequest, Fetcher, ReqwestTransport, Transport};
use keystone_types::{CacheKey, Failure, codes};

use crate::runner::{Execution, Runner, RunnerSnapshot};

/// Everything a consumer renders for one query.
#[derive(Debug, Clone)]
pub struct QuerySnapshot<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<Failure>,
    pub result: Option<Result<T, Failure>>,
    /// The current result was served from the cache.
    pub is_cached: bool,
    /// The cached result is past its stale time.
    pub is_stale: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct CacheFlags {
    is_cached: bool,
    is_stale: bool,
}

pub struct QueryBuilder<T, X = ReqwestTransport> {
    fetcher: Fetcher<X>,
    request: FetchRequest,
    options: FetchOptions,
    cache: Option<(Arc<ResultCache>, CachePolicy)>,
    key: Option<CacheKey>,
    _output: PhantomData<fn() -> T>,
}

impl<T, X> QueryBuilder<T, X>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    X: Transport + 'static,
{
    #[must_use]
    pub fn options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    /// Serve and store results through `cache`.
    #[must_use]
    pub fn cache(mut self, cache: Arc<ResultCache>, policy: CachePolicy) -> Self {
        self.cache = Some((cache, policy));
        self
    }

    /// Override the key derived from method, URL and body.
    #[must_use]
    pub fn key(mut self, key: CacheKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn build(self) -> Result<Query<T, X>, Failure> {
        let key = match self.key {
            Some(key) => key,
            None => CacheKey::new(self.request.cache_key(self.options.base_url())).map_err(|e| {
                Failure::validation(format!("cannot derive a cache key: {e}"))
                    .with_code(codes::INVALID_REQUEST)
            })?,
        };
        if TypeId::of::<T>() == TypeId::of::<Value>() && !self.options.checks_response() {
            tracing::warn!(
                key = %key,
                "Query decodes into untyped JSON with no validator or transform; bodies are unchecked"
            );
        }

        Ok(Query {
            inner: Arc::new(QueryInner {
                runner: Runner::new(),
                fetcher: self.fetcher,
                request: self.request,
                options: self.options,
                cache: self.cache,
                key,
                flags: Mutex::new(CacheFlags::default()),
            }),
            focus_task: Mutex::new(None),
        })
    }
}

struct QueryInner<T, X> {
    runner: Runner<T>,
    fetcher: Fetcher<X>,
    request: FetchRequest,
    options: FetchOptions,
    cache: Option<(Arc<ResultCache>, CachePolicy)>,
    key: CacheKey,
    flags: Mutex<CacheFlags>,
}

impl<T, X> QueryInner<T, X>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    X: Transport + 'static,
{
    fn flags(&self) -> MutexGuard<'_, CacheFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_flags(&self, flags: CacheFlags) {
        *self.flags() = flags;
    }

    /// Network fetch through the runner; the completion is written to the
    /// cache before it settles.
    fn refetch(self: &Arc<Self>) -> impl Future<Output = Execution<T>> + Send + use<T, X> {
        let inner = Arc::clone(self);
        let run = self.runner.execute(async move {
            let result = inner
                .fetcher
                .fetch::<T>(&inner.request, &inner.options)
                .await;
            if let Some((cache, _)) = &inner.cache {
                cache.set(inner.key.clone(), result.clone());
            }
            result
        });

        let inner = Arc::clone(self);
        async move {
            let outcome = run.await;
            if !outcome.is_cancelled() {
                inner.set_flags(CacheFlags::default());
            }
            outcome
        }
    }

    fn needs_revalidation(&self) -> bool {
        match &self.cache {
            Some((cache, policy)) => cache
                .get::<T>(&self.key, policy)
                .is_none_or(|entry| entry.is_stale),
            None => true,
        }
    }
}

/// One request bound to a [`Runner`] and, optionally, the shared cache.
///
/// Dropping the query aborts its in-flight fetch and its focus watcher.
pub struct Query<T, X = ReqwestTransport> {
    inner: Arc<QueryInner<T, X>>,
    focus_task: Mutex<Option<AbortHandle>>,
}

impl<T, X> fmt::Debug for Query<T, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("runner", &self.inner.runner)
            .field("method", self.inner.request.method())
            .field("cached", &self.inner.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl<T, X> Query<T, X>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    X: Transport + 'static,
{
    pub fn builder(fetcher: Fetcher<X>, request: FetchRequest) -> QueryBuilder<T, X> {
        QueryBuilder {
            fetcher,
            request,
            options: FetchOptions::default(),
            cache: None,
            key: None,
            _output: PhantomData,
        }
    }

    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    /// Serve a valid cache entry, or fetch.
    pub async fn load(&self) -> Execution<T> {
        if let Some((cache, policy)) = &self.inner.cache
            && let Some(entry) = cache.get::<T>(&self.inner.key, policy)
        {
            let is_stale = entry.is_stale;
            let outcome = self.inner.runner.execute(ready(entry.result)).await;
            if !outcome.is_cancelled() {
                self.inner.set_flags(CacheFlags {
                    is_cached: true,
                    is_stale,
                });
            }
            return outcome;
        }
        self.refetch().await
    }

    /// Always go to the network and overwrite the cache entry.
    pub async fn refetch(&self) -> Execution<T> {
        self.inner.refetch().await
    }

    /// Refetch in the background if the entry is missing or stale.
    pub fn revalidate(&self) -> Option<JoinHandle<Execution<T>>> {
        if !self.inner.needs_revalidation() {
            return None;
        }
        Some(tokio::spawn(self.inner.refetch()))
    }

    /// Revalidate whenever `signal` fires. Returns false (and does nothing)
    /// when the query is uncached or its policy disables focus refetching.
    /// A second call replaces the previous watcher.
    pub fn watch_focus(&self, signal: &FocusSignal) -> bool {
        let Some((_, policy)) = &self.inner.cache else {
            return false;
        };
        if !policy.refetch_on_focus {
            return false;
        }

        let (handle, registration) = AbortHandle::new_pair();
        let task = Abortable::new(
            watch_focus_events(Arc::downgrade(&self.inner), signal.subscribe()),
            registration,
        );
        tokio::spawn(task);

        let previous = self
            .focus_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }

    /// Drop the cache entry so the next `load` fetches.
    pub fn invalidate(&self) -> bool {
        match &self.inner.cache {
            Some((cache, _)) => cache.invalidate(&self.inner.key),
            None => false,
        }
    }

    pub fn cancel(&self) {
        self.inner.runner.cancel();
    }

    #[must_use]
    pub fn snapshot(&self) -> QuerySnapshot<T> {
        let RunnerSnapshot { loading, result } = self.inner.runner.snapshot();
        let flags = *self.inner.flags();
        QuerySnapshot {
            data: result.as_ref().and_then(|r| r.as_ref().ok()).cloned(),
            error: result.as_ref().and_then(|r| r.as_ref().err()).cloned(),
            loading,
            result,
            is_cached: flags.is_cached,
            is_stale: flags.is_stale,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunnerSnapshot<T>> {
        self.inner.runner.subscribe()
    }
}

async fn watch_focus_events<T, X>(
    inner: Weak<QueryInner<T, X>>,
    mut focus: broadcast::Receiver<()>,
) where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
    X: Transport + 'static,
{
    loop {
        match focus.recv().await {
            Ok(()) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Focus events coalesced");
            }
            Err(RecvError::Closed) => break,
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.needs_revalidation() {
            tracing::debug!("Revalidating query on focus");
            let _ = inner.refetch().await;
        }
    }
}

impl<T, X> Drop for Query<T, X> {
    fn drop(&mut self) {
        if let Some(task) = self
            .focus_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.inner.runner.cancel();
    }
}
