//! Cancellation source, token and callback registration.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::util::{Slab, SlotKey};

type Callback = Box<dyn FnOnce() + Send>;

/// Shared state behind a source and all of its tokens.
struct SignalState {
    cancelled: AtomicBool,
    callbacks: Mutex<Slab<Callback>>,
}

impl SignalState {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            callbacks: Mutex::new(Slab::new()),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fire(&self) -> bool {
        let callbacks = {
            let mut callbacks = self.callbacks.lock();
            if self.cancelled.swap(true, Ordering::AcqRel) {
                return false;
            }
            callbacks.take_all()
        };

        for callback in callbacks {
            callback();
        }
        true
    }
}

/// The firing side of a cancellation signal.
///
/// Clones refer to the same signal.
#[derive(Clone)]
pub struct CancelSource {
    state: Arc<SignalState>,
}

impl CancelSource {
    /// Creates a signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// Returns a token observing this signal.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Fires the signal.
    ///
    /// Registered callbacks run on this thread before the call returns.
    /// Returns true if this call fired the signal (first caller wins).
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self) -> bool {
        self.state.fire()
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The observing side of a cancellation signal.
///
/// [`CancelToken::none`] yields a token that can never fire and costs no
/// allocation; it is the default for callers that never cancel.
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Option<Arc<SignalState>>,
}

impl CancelToken {
    /// Returns a token that is never cancelled.
    #[must_use]
    pub const fn none() -> Self {
        Self { state: None }
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_cancelled())
    }

    /// Returns true if this token can ever fire.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.state.is_some()
    }

    /// Returns true if both tokens observe the same signal.
    #[must_use]
    pub fn same_source(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Registers `callback` to run when the signal fires.
    ///
    /// If the signal already fired, `callback` runs on this thread before
    /// `register` returns. Dropping the returned registration unregisters a
    /// callback that has not run yet.
    pub fn register<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(state) = &self.state else {
            return CancelRegistration::empty();
        };

        let mut callbacks = state.callbacks.lock();
        if state.is_cancelled() {
            // Already fired: run outside the lock.
            drop(callbacks);
            callback();
            return CancelRegistration::empty();
        }

        let key = callbacks.insert(Box::new(callback) as Callback);
        CancelRegistration {
            state: Arc::downgrade(state),
            key: Some(key),
        }
    }

    /// Returns a future that resolves once the signal fires.
    ///
    /// For [`CancelToken::none`] the future never resolves.
    #[must_use]
    pub fn cancelled(&self) -> WaitCancelled {
        WaitCancelled {
            token: self.clone(),
            waker: Arc::new(Mutex::new(None)),
            registration: None,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            None => f.write_str("CancelToken(none)"),
            Some(state) if state.is_cancelled() => f.write_str("CancelToken(cancelled)"),
            Some(_) => f.write_str("CancelToken(pending)"),
        }
    }
}

/// A callback registered on a [`CancelToken`].
///
/// Dropping the registration (or calling [`dispose`](Self::dispose))
/// removes a callback that has not run yet. Disposal after the callback ran,
/// or from inside the callback itself, is a no-op.
#[must_use = "dropping a registration unregisters its callback"]
pub struct CancelRegistration {
    state: Weak<SignalState>,
    key: Option<SlotKey>,
}

impl CancelRegistration {
    fn empty() -> Self {
        Self {
            state: Weak::new(),
            key: None,
        }
    }

    /// Returns true if a callback is still registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        let (Some(key), Some(state)) = (self.key, self.state.upgrade()) else {
            return false;
        };
        let callbacks = state.callbacks.lock();
        callbacks.contains(key)
    }

    /// Unregisters the callback if it has not run.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        if let Some(state) = self.state.upgrade() {
            let removed = state.callbacks.lock().remove(key);
            // Dropped outside the lock: the callback may own arbitrary state.
            drop(removed);
        }
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("key", &self.key)
            .finish()
    }
}

/// Future returned by [`CancelToken::cancelled`].
pub struct WaitCancelled {
    token: CancelToken,
    waker: Arc<Mutex<Option<Waker>>>,
    registration: Option<CancelRegistration>,
}

impl Future for WaitCancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }

        {
            let mut slot = self.waker.lock();
            match slot.as_ref() {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => *slot = Some(cx.waker().clone()),
            }
        }

        if self.registration.is_none() {
            let waker = Arc::clone(&self.waker);
            let registration = self.token.register(move || {
                let waker = waker.lock().take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            self.registration = Some(registration);
        }

        // Double-check after registering.
        if self.token.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for WaitCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitCancelled")
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    #[test]
    fn cancel_fires_once() {
        init_test("cancel_fires_once");
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        assert!(source.cancel());
        assert!(!source.cancel());
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
        crate::test_complete!("cancel_fires_once");
    }

    #[test]
    fn none_token_never_fires() {
        init_test("none_token_never_fires");
        let token = CancelToken::none();
        assert!(!token.can_be_cancelled());
        let registration = token.register(|| unreachable!("none token fired"));
        assert!(!registration.is_registered());
        assert!(!token.is_cancelled());
        crate::test_complete!("none_token_never_fires");
    }

    #[test]
    fn callbacks_run_on_cancel() {
        init_test("callbacks_run_on_cancel");
        let source = CancelSource::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let registrations: Vec<_> = (0..3)
            .map(|_| {
                let hits = Arc::clone(&hits);
                source.token().register(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert!(registrations.iter().all(CancelRegistration::is_registered));

        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!registrations.iter().any(CancelRegistration::is_registered));
        crate::test_complete!("callbacks_run_on_cancel");
    }

    #[test]
    fn register_after_cancel_runs_inline() {
        init_test("register_after_cancel_runs_inline");
        let source = CancelSource::new();
        source.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let registration = source.token().register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!registration.is_registered());
        crate::test_complete!("register_after_cancel_runs_inline");
    }

    #[test]
    fn disposed_registration_does_not_run() {
        init_test("disposed_registration_does_not_run");
        let source = CancelSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let registration = source.token().register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        registration.dispose();
        source.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        crate::test_complete!("disposed_registration_does_not_run");
    }

    #[test]
    fn callback_may_register_on_same_signal() {
        init_test("callback_may_register_on_same_signal");
        let source = CancelSource::new();
        let token = source.token();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_token = token.clone();
        let inner_hits = Arc::clone(&hits);
        let _registration = token.register(move || {
            let hits = Arc::clone(&inner_hits);
            // Signal already fired, so this runs inline without deadlocking.
            let _nested = inner_token.register(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        });

        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        crate::test_complete!("callback_may_register_on_same_signal");
    }

    #[test]
    fn same_source_compares_identity() {
        init_test("same_source_compares_identity");
        let a = CancelSource::new();
        let b = CancelSource::new();
        assert!(a.token().same_source(&a.token()));
        assert!(!a.token().same_source(&b.token()));
        assert!(CancelToken::none().same_source(&CancelToken::none()));
        crate::test_complete!("same_source_compares_identity");
    }

    #[test]
    fn cancelled_future_resolves_across_threads() {
        init_test("cancelled_future_resolves_across_threads");
        let source = CancelSource::new();
        let token = source.token();

        let firing = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            source.cancel();
        });

        futures_lite::future::block_on(token.cancelled());
        assert!(token.is_cancelled());
        firing.join().expect("firing thread panicked");
        crate::test_complete!("cancelled_future_resolves_across_threads");
    }

    #[test]
    fn cancelled_future_is_ready_when_already_fired() {
        init_test("cancelled_future_is_ready_when_already_fired");
        let source = CancelSource::new();
        source.cancel();
        let ready = futures_lite::future::block_on(futures_lite::future::poll_once(
            source.token().cancelled(),
        ));
        assert_eq!(ready, Some(()));
        crate::test_complete!("cancelled_future_is_ready_when_already_fired");
    }
}
