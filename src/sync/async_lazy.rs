//! Cancellable, coalescing, memoizing lazy cell.
//!
//! [`AsyncLazy`] computes a value at most once per round and shares it with
//! every caller that asked for it while the round was running. Callers may
//! block ([`AsyncLazy::get_blocking`]) or receive a [`Deferred`]
//! ([`AsyncLazy::get_async`]); both are modelled as requests over the same
//! deferred result.
//!
//! # States
//!
//! - **Idle**: nothing cached, nothing running
//! - **ComputingSync**: a blocking caller runs the synchronous compute
//!   function inline
//! - **ComputingAsync**: the asynchronous compute function runs under a
//!   round-owned [`CancelSource`]
//! - **Cached**: terminal; the compute functions have been released
//!
//! # Cancellation
//!
//! Each request registers on its caller's token. A firing token removes only
//! that request. When the last request of an asynchronous round leaves, the
//! round's source is cancelled and the cell returns to Idle; a caller arriving
//! afterwards starts a fresh round.
//!
//! # Locking
//!
//! One mutex per cell guards the state transitions. Compute functions run,
//! cancellation sources fire, and requests are completed outside of it.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Wake, Waker};

use futures_lite::future::{self, Boxed};
use futures_lite::FutureExt;
use parking_lot::Mutex;

use crate::cancel::{CancelSource, CancelToken};
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::{self, Spawn};
use crate::sync::deferred::Deferred;
use crate::sync::request::{Request, RequestKey, RequestSet};
use crate::tracing_compat::{debug, trace, warn};

type AsyncCompute<T> = Arc<dyn Fn(CancelToken) -> Boxed<Result<T>> + Send + Sync>;
type SyncCompute<T> = Arc<dyn Fn(&CancelToken) -> Result<T> + Send + Sync>;

struct State<T> {
    async_compute: Option<AsyncCompute<T>>,
    sync_compute: Option<SyncCompute<T>>,
    /// Never present-but-empty.
    requests: Option<RequestSet<T>>,
    /// Present iff an asynchronous round is running.
    computation_cancel: Option<CancelSource>,
    computation_active: bool,
    next_epoch: u64,
    rounds: u64,
}

impl<T> State<T> {
    fn add_request(&mut self, token: CancelToken) -> (RequestKey, Arc<Request<T>>, Deferred<T>) {
        let (request, deferred) = Request::new(token);
        if self.requests.is_none() {
            self.requests = Some(RequestSet::new(self.next_epoch));
            self.next_epoch += 1;
        }
        let key = match self.requests.as_mut() {
            Some(set) => set.insert(Arc::clone(&request)),
            None => unreachable!("request set was just created"),
        };
        (key, request, deferred)
    }

    fn phase(&self) -> &'static str {
        if self.computation_cancel.is_some() {
            "ComputingAsync"
        } else if self.computation_active {
            "ComputingSync"
        } else {
            "Idle"
        }
    }

    fn waiters(&self) -> usize {
        self.requests.as_ref().map_or(0, RequestSet::len)
    }

    #[cfg(debug_assertions)]
    fn assert_invariants(&self, cached: bool) {
        if cached {
            assert!(
                self.async_compute.is_none() && self.sync_compute.is_none(),
                "cached cell still holds its compute functions"
            );
        }
        if self.computation_cancel.is_some() {
            assert!(self.computation_active, "round source without active computation");
        }
        if let Some(requests) = &self.requests {
            assert!(!requests.is_empty(), "empty request set left allocated");
            assert!(self.computation_active, "requests waiting without a computation");
        }
        if self.sync_compute.is_some() {
            assert!(self.async_compute.is_some(), "sync compute without async compute");
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn assert_invariants(&self, _cached: bool) {}
}

struct Shared<T> {
    cached: OnceLock<Result<T>>,
    state: Mutex<State<T>>,
    spawner: Option<Arc<dyn Spawn>>,
}

/// How a round finished.
enum Completion {
    /// The synchronous compute function ran inline.
    Sync,
    /// An asynchronous round, identified by its signal.
    Async(CancelToken),
}

/// An asynchronous round registered under the lock, not yet started.
struct Round<T> {
    id: u64,
    compute: AsyncCompute<T>,
    source: CancelSource,
}

enum Plan<T> {
    RunSync(SyncCompute<T>),
    Wait {
        key: RequestKey,
        request: Arc<Request<T>>,
        deferred: Deferred<T>,
        round: Option<Round<T>>,
    },
}

/// A lazily computed, memoized value shared by blocking and async callers.
///
/// `AsyncLazy` is a cheap handle; clones share the same cell.
///
/// # Example
///
/// ```ignore
/// let cell = AsyncLazy::new(|_cancel| async { Ok(load_config()?) });
///
/// // Blocking callers and async callers coalesce onto one computation.
/// let config = cell.get_blocking(&CancelToken::none())?;
/// let again = cell.get_async(&CancelToken::none()).await?;
/// ```
pub struct AsyncLazy<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncLazy<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> AsyncLazy<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a cell that is already cached.
    #[must_use]
    pub fn with_value(value: T) -> Self {
        let cached = OnceLock::new();
        let _ = cached.set(Ok(value));
        Self::from_parts(cached, None, None, None)
    }

    /// Creates a cell computed by an asynchronous function.
    ///
    /// The function receives the round's cancellation token, which fires once
    /// every caller of that round has cancelled.
    pub fn new<F, Fut>(compute: F) -> Self
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::builder().build(compute)
    }

    /// Creates a cell with both an asynchronous and a synchronous compute
    /// function.
    ///
    /// A blocking caller that finds the cell idle runs `sync_compute` inline
    /// with its own token instead of dispatching to the background.
    pub fn with_sync<F, Fut, S>(compute: F, sync_compute: S) -> Self
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        S: Fn(&CancelToken) -> Result<T> + Send + Sync + 'static,
    {
        Self::builder().build_with_sync(compute, sync_compute)
    }

    /// Returns a builder for cells with a non-default [`Spawn`].
    #[must_use]
    pub fn builder() -> AsyncLazyBuilder<T> {
        AsyncLazyBuilder::new()
    }

    fn from_parts(
        cached: OnceLock<Result<T>>,
        async_compute: Option<AsyncCompute<T>>,
        sync_compute: Option<SyncCompute<T>>,
        spawner: Option<Arc<dyn Spawn>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cached,
                state: Mutex::new(State {
                    async_compute,
                    sync_compute,
                    requests: None,
                    computation_cancel: None,
                    computation_active: false,
                    next_epoch: 0,
                    rounds: 0,
                }),
                spawner,
            }),
        }
    }

    /// Returns the cached value without blocking or starting a computation.
    ///
    /// A cached failure reads as `None`.
    #[must_use]
    pub fn try_peek(&self) -> Option<T> {
        self.shared
            .cached
            .get()
            .and_then(|result| result.as_ref().ok().cloned())
    }

    /// Returns true once a result (value or permanent failure) is cached.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.shared.cached.get().is_some()
    }

    /// Returns the value, blocking the current thread until it is available.
    ///
    /// Fails with [`ErrorKind::Cancelled`] if `cancel` fires first; the
    /// computation keeps running for any other caller.
    pub fn get_blocking(&self, cancel: &CancelToken) -> Result<T> {
        if let Some(result) = self.shared.cached.get() {
            return result.clone();
        }
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }

        let plan = {
            let mut state = self.shared.state.lock();
            if let Some(result) = self.shared.cached.get() {
                return result.clone();
            }

            let plan = if state.computation_active {
                let (key, request, deferred) = state.add_request(cancel.clone());
                trace!(waiters = state.waiters(), "blocking caller joined running round");
                Plan::Wait {
                    key,
                    request,
                    deferred,
                    round: None,
                }
            } else if let Some(sync_compute) = state.sync_compute.clone() {
                state.computation_active = true;
                trace!("Idle -> ComputingSync");
                Plan::RunSync(sync_compute)
            } else {
                let (key, request, deferred) = state.add_request(cancel.clone());
                let round = Self::register_async_computation(&mut state);
                Plan::Wait {
                    key,
                    request,
                    deferred,
                    round: Some(round),
                }
            };
            state.assert_invariants(false);
            plan
        };

        match plan {
            Plan::RunSync(sync_compute) => self.run_sync(&sync_compute, cancel),
            Plan::Wait {
                key,
                request,
                deferred,
                round,
            } => {
                self.register_for_cancellation(key, &request);
                if let Some(round) = round {
                    self.start_async_computation(round);
                }
                deferred.wait()
            }
        }
    }

    /// Returns a [`Deferred`] for the value without blocking.
    ///
    /// Starts an asynchronous round if none is running. If `cancel` fires
    /// before the value is available, the deferred resolves to
    /// [`ErrorKind::Cancelled`].
    pub fn get_async(&self, cancel: &CancelToken) -> Deferred<T> {
        if let Some(result) = self.shared.cached.get() {
            return Deferred::ready(result.clone());
        }
        if cancel.is_cancelled() {
            return Deferred::ready(Err(Error::cancelled()));
        }

        let (key, request, deferred, round) = {
            let mut state = self.shared.state.lock();
            if let Some(result) = self.shared.cached.get() {
                return Deferred::ready(result.clone());
            }

            let (key, request, deferred) = state.add_request(cancel.clone());
            let round = if state.computation_active {
                trace!(waiters = state.waiters(), "async caller joined running round");
                None
            } else {
                Some(Self::register_async_computation(&mut state))
            };
            state.assert_invariants(false);
            (key, request, deferred, round)
        };

        self.register_for_cancellation(key, &request);
        if let Some(round) = round {
            self.start_async_computation(round);
        }
        deferred
    }

    fn run_sync(&self, sync_compute: &SyncCompute<T>, cancel: &CancelToken) -> Result<T> {
        let result = catch_unwind(AssertUnwindSafe(|| sync_compute(cancel)))
            .unwrap_or_else(|payload| Err(Error::panicked(payload.as_ref())));

        match result {
            Err(err) if err.is_cancelled() && cancel.is_cancelled() => {
                let round = {
                    let mut state = self.shared.state.lock();
                    state.computation_active = false;
                    let round = state
                        .requests
                        .is_some()
                        .then(|| Self::register_async_computation(&mut state));
                    state.assert_invariants(false);
                    round
                };
                match round {
                    Some(round) => {
                        debug!(round = round.id, "inline run cancelled; promoting waiters");
                        self.start_async_computation(round);
                    }
                    None => trace!("ComputingSync -> Idle (cancelled)"),
                }
                Err(err)
            }
            result => {
                self.complete_round(result.clone(), Completion::Sync);
                result
            }
        }
    }

    /// Opens an asynchronous round. The caller holds the lock.
    fn register_async_computation(state: &mut State<T>) -> Round<T> {
        let Some(compute) = state.async_compute.clone() else {
            unreachable!("computation requested on a cell without a compute function");
        };
        let source = CancelSource::new();
        state.computation_cancel = Some(source.clone());
        state.computation_active = true;
        state.rounds += 1;
        trace!(round = state.rounds, "-> ComputingAsync");
        Round {
            id: state.rounds,
            compute,
            source,
        }
    }

    /// Invokes the asynchronous compute function for `round`.
    ///
    /// The future is polled once on this thread; if it settles, the round
    /// completes inline. Otherwise it is handed to the spawner.
    fn start_async_computation(&self, round: Round<T>) {
        let signal = round.source.token();
        if signal.is_cancelled() {
            // Every request left before the round got going.
            trace!(round = round.id, "round abandoned before start");
            return;
        }
        debug!(round = round.id, "starting computation");

        let future = match catch_unwind(AssertUnwindSafe(|| (round.compute)(signal.clone()))) {
            Ok(future) => future,
            Err(payload) => {
                self.complete_round(
                    Err(Error::panicked(payload.as_ref())),
                    Completion::Async(signal),
                );
                return;
            }
        };

        let guarded = async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(Error::panicked(payload.as_ref())),
            }
        };
        let abandoned = signal.cancelled();
        let mut task: Boxed<Result<T>> = future::or(guarded, async move {
            abandoned.await;
            Err(Error::cancelled())
        })
        .boxed();

        let waker = Waker::from(Arc::new(NoopWaker));
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(result) = task.as_mut().poll(&mut cx) {
            trace!(round = round.id, "computation settled inline");
            self.complete_round(result, Completion::Async(signal));
            return;
        }

        // The running round keeps the cell alive so its waiters are served
        // even after every handle is dropped.
        let guard = RoundGuard {
            cell: Some(Arc::clone(&self.shared)),
            signal: signal.clone(),
        };
        let job = async move {
            let result = task.await;
            guard.finish(result);
        };

        let spawned = match &self.shared.spawner {
            Some(spawner) => spawner.spawn(job.boxed()),
            None => runtime::global().spawn(job.boxed()),
        };
        if let Err(err) = spawned {
            warn!(round = round.id, error = %err, "failed to dispatch computation");
            self.complete_round(Err(err), Completion::Async(signal));
            round.source.cancel();
        }
    }

    /// Finishes the current round with `result` and delivers it.
    ///
    /// An asynchronous completion whose round is no longer current is
    /// ignored.
    fn complete_round(&self, result: Result<T>, completion: Completion) {
        let (requests, result) = {
            let mut state = self.shared.state.lock();

            if let Completion::Async(signal) = &completion {
                let current = state
                    .computation_cancel
                    .as_ref()
                    .is_some_and(|source| source.token().same_source(signal));
                if !current {
                    trace!("stale round completion ignored");
                    return;
                }
                assert!(
                    !(signal.is_cancelled() && state.requests.is_some()),
                    "round signal fired while requests were still waiting"
                );
            }

            let requests = state.requests.take();
            state.computation_cancel = None;
            state.computation_active = false;

            let result = if let Some(cached) = self.shared.cached.get() {
                cached.clone()
            } else {
                let cache = match (&result, &completion) {
                    (Ok(_), _) => true,
                    (Err(err), Completion::Sync) => {
                        requests.is_none() && err.kind() == ErrorKind::Failed
                    }
                    (Err(_), Completion::Async(_)) => false,
                };
                if cache {
                    let _ = self.shared.cached.set(result.clone());
                    state.async_compute = None;
                    state.sync_compute = None;
                    debug!(
                        ok = result.is_ok(),
                        waiters = requests.as_ref().map_or(0, RequestSet::len),
                        "-> Cached"
                    );
                } else {
                    debug!(
                        error = ?result.as_ref().err(),
                        waiters = requests.as_ref().map_or(0, RequestSet::len),
                        "-> Idle (round failed)"
                    );
                }
                result
            };

            state.assert_invariants(self.shared.cached.get().is_some());
            (requests, result)
        };

        if let Some(requests) = requests {
            for request in requests.into_requests() {
                request.complete_from(&result);
            }
        }
    }

    fn register_for_cancellation(&self, key: RequestKey, request: &Arc<Request<T>>) {
        if !request.token().can_be_cancelled() {
            return;
        }
        let cell = Arc::downgrade(&self.shared);
        let registration = request.token().register(move || {
            if let Some(shared) = cell.upgrade() {
                AsyncLazy { shared }.on_request_cancelled(key);
            }
        });
        request.attach_registration(registration);
    }

    /// Removes a cancelled request; cancels the round if it was the last.
    fn on_request_cancelled(&self, key: RequestKey) {
        let (request, source) = {
            let mut state = self.shared.state.lock();
            let Some(requests) = state.requests.as_mut() else {
                return;
            };
            let Some(request) = requests.remove(key) else {
                return;
            };

            let source = if requests.is_empty() {
                state.requests = None;
                let source = state.computation_cancel.take();
                if source.is_some() {
                    // An inline sync run keeps going for its own caller.
                    state.computation_active = false;
                }
                source
            } else {
                None
            };
            state.assert_invariants(false);
            (request, source)
        };

        request.cancel();
        if let Some(source) = source {
            debug!("last request cancelled; abandoning round");
            source.cancel();
        }
    }
}

impl<T> fmt::Debug for AsyncLazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AsyncLazy");
        if self.shared.cached.get().is_some() {
            d.field("state", &"Cached");
        } else if let Some(state) = self.shared.state.try_lock() {
            d.field("state", &state.phase())
                .field("waiters", &state.waiters())
                .field("rounds", &state.rounds);
        } else {
            d.field("state", &"<locked>");
        }
        d.finish()
    }
}

/// Completes an asynchronous round from its background task.
///
/// If the task is dropped without finishing (for example by a pool shutting
/// down), the round fails with [`ErrorKind::Spawn`] so waiters are released.
struct RoundGuard<T: Clone + Send + Sync + 'static> {
    cell: Option<Arc<Shared<T>>>,
    signal: CancelToken,
}

impl<T: Clone + Send + Sync + 'static> RoundGuard<T> {
    fn finish(mut self, result: Result<T>) {
        self.complete(result);
    }

    fn complete(&mut self, result: Result<T>) {
        let Some(shared) = self.cell.take() else {
            return;
        };
        AsyncLazy { shared }.complete_round(result, Completion::Async(self.signal.clone()));
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for RoundGuard<T> {
    fn drop(&mut self) {
        if self.cell.is_some() {
            self.complete(Err(Error::spawn("computation dropped before completion")));
        }
    }
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

/// Builder for [`AsyncLazy`] cells with a custom [`Spawn`].
pub struct AsyncLazyBuilder<T> {
    spawner: Option<Arc<dyn Spawn>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AsyncLazyBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a builder that uses the global pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            spawner: None,
            _marker: PhantomData,
        }
    }

    /// Runs computations that do not settle inline on `spawner`.
    #[must_use]
    pub fn spawner(mut self, spawner: Arc<dyn Spawn>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Builds a cell with an asynchronous compute function.
    pub fn build<F, Fut>(self, compute: F) -> AsyncLazy<T>
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        AsyncLazy::from_parts(OnceLock::new(), Some(box_compute(compute)), None, self.spawner)
    }

    /// Builds a cell with asynchronous and synchronous compute functions.
    pub fn build_with_sync<F, Fut, S>(self, compute: F, sync_compute: S) -> AsyncLazy<T>
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        S: Fn(&CancelToken) -> Result<T> + Send + Sync + 'static,
    {
        AsyncLazy::from_parts(
            OnceLock::new(),
            Some(box_compute(compute)),
            Some(Arc::new(sync_compute)),
            self.spawner,
        )
    }
}

impl<T> Default for AsyncLazyBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for AsyncLazyBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLazyBuilder")
            .field("custom_spawner", &self.spawner.is_some())
            .finish()
    }
}

fn box_compute<T, F, Fut>(compute: F) -> AsyncCompute<T>
where
    T: 'static,
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move |token: CancelToken| -> Boxed<Result<T>> { compute(token).boxed() })
}
