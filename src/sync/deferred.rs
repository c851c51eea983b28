//! One-shot deferred result.
//!
//! A [`Deferred`] is a result that may not be known yet. It can be consumed
//! two ways, which is how blocking and non-blocking callers share one
//! abstraction:
//!
//! - as a [`Future`] (registers a waker and returns `Pending`)
//! - via [`Deferred::wait`] (parks the calling thread on a condvar)
//!
//! The producing side is a [`Completer`]. Completion is first-writer-wins;
//! later attempts are ignored and report `false`.
//!
//! # Wakeup ordering
//!
//! Wakers and blocked threads are notified after the slot lock is released,
//! so a continuation never runs while the slot is locked.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::{Error, Result};

enum SlotState<T> {
    Pending { wakers: SmallVec<[Waker; 2]> },
    Done(Result<T>),
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn pending() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending {
                wakers: SmallVec::new(),
            }),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T>) -> bool {
        let wakers = {
            let mut state = self.state.lock();
            match &mut *state {
                SlotState::Done(_) => return false,
                SlotState::Pending { wakers } => {
                    let wakers = std::mem::take(wakers);
                    *state = SlotState::Done(result);
                    wakers
                }
            }
        };

        self.ready.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    fn is_completed(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Done(_))
    }
}

/// A result of type `T` that may not be known yet.
///
/// Clones observe the same result.
pub struct Deferred<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Deferred<T> {
    /// Creates a deferred result that is already completed.
    #[must_use]
    pub fn ready(result: Result<T>) -> Self {
        Self {
            slot: Arc::new(Slot {
                state: Mutex::new(SlotState::Done(result)),
                ready: Condvar::new(),
            }),
        }
    }

    /// Creates a linked completer/deferred pair.
    #[must_use]
    pub fn pending() -> (Completer<T>, Self) {
        let slot = Arc::new(Slot::pending());
        (
            Completer {
                slot: Arc::clone(&slot),
            },
            Self { slot },
        )
    }

    /// Returns true once a result is available.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.slot.is_completed()
    }
}

impl<T: Clone> Deferred<T> {
    /// Returns the result if it is available, without blocking.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<T>> {
        match &*self.slot.state.lock() {
            SlotState::Done(result) => Some(result.clone()),
            SlotState::Pending { .. } => None,
        }
    }

    /// Blocks the current thread until the result is available.
    pub fn wait(&self) -> Result<T> {
        let mut state = self.slot.state.lock();
        loop {
            if let SlotState::Done(result) = &*state {
                return result.clone();
            }
            self.slot.ready.wait(&mut state);
        }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock();
        match &mut *state {
            SlotState::Done(result) => Poll::Ready(result.clone()),
            SlotState::Pending { wakers } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// The producing side of a [`Deferred`].
///
/// Dropping a completer that never completed resolves its deferred with an
/// [`ErrorKind::Internal`](crate::ErrorKind::Internal) error, so waiters are
/// never stranded.
pub struct Completer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completer<T> {
    /// Completes the deferred result.
    ///
    /// Returns false if it was already completed; `result` is dropped.
    #[allow(clippy::must_use_candidate)]
    pub fn complete(&self, result: Result<T>) -> bool {
        self.slot.complete(result)
    }

    /// Returns true once a result has been stored.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.slot.is_completed()
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.slot.complete(Err(Error::internal("completer dropped")));
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;
    use std::thread;
    use std::time::Duration;

    fn init_test(test_name: &str) {
        init_test_logging();
        crate::test_phase!(test_name);
    }

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ready_is_completed() {
        init_test("ready_is_completed");
        let deferred = Deferred::ready(Ok(7));
        assert!(deferred.is_completed());
        assert_eq!(deferred.try_get().map(|r| r.ok()), Some(Some(7)));
        assert_eq!(deferred.wait().ok(), Some(7));
        crate::test_complete!("ready_is_completed");
    }

    #[test]
    fn first_writer_wins() {
        init_test("first_writer_wins");
        let (completer, deferred) = Deferred::pending();
        assert!(deferred.try_get().is_none());

        assert!(completer.complete(Ok(1)));
        assert!(!completer.complete(Ok(2)));
        assert_eq!(deferred.wait().ok(), Some(1));
        crate::test_complete!("first_writer_wins");
    }

    #[test]
    fn wait_blocks_until_completed() {
        init_test("wait_blocks_until_completed");
        let (completer, deferred) = Deferred::pending();

        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok("done"));
        });

        assert_eq!(deferred.wait().ok(), Some("done"));
        producer.join().expect("producer panicked");
        crate::test_complete!("wait_blocks_until_completed");
    }

    #[test]
    fn poll_registers_waker_once_per_task() {
        init_test("poll_registers_waker_once_per_task");
        let (completer, mut deferred) = Deferred::<u32>::pending();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut deferred).poll(&mut cx).is_pending());
        assert!(Pin::new(&mut deferred).poll(&mut cx).is_pending());

        completer.complete(Ok(5));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        match Pin::new(&mut deferred).poll(&mut cx) {
            Poll::Ready(Ok(v)) => assert_eq!(v, 5),
            other => panic!("expected ready value, got {other:?}"),
        }
        crate::test_complete!("poll_registers_waker_once_per_task");
    }

    #[test]
    fn clones_observe_same_result() {
        init_test("clones_observe_same_result");
        let (completer, deferred) = Deferred::<()>::pending();
        let clone = deferred.clone();
        completer.complete(Err(Error::failed_msg("nope")));

        let a = deferred.wait().expect_err("expected failure");
        let b = futures_lite::future::block_on(clone).expect_err("expected failure");
        assert!(a.same_failure(&b));
        crate::test_complete!("clones_observe_same_result");
    }

    #[test]
    fn dropped_completer_resolves_internal_error() {
        init_test("dropped_completer_resolves_internal_error");
        let (completer, deferred) = Deferred::<()>::pending();
        drop(completer);
        crate::assert_err_kind!(deferred.wait(), ErrorKind::Internal);
        crate::test_complete!("dropped_completer_resolves_internal_error");
    }
}
