//! Outstanding caller interest in a lazy cell's result.
//!
//! A [`Request`] is one caller's cancellable promise of the value. It owns the
//! registration on that caller's cancellation token and releases it as soon as
//! the request completes, whichever way it completes.
//!
//! Requests of one computation round live in a [`RequestSet`], a slot arena
//! with O(1) removal by [`RequestKey`]. Each set carries an epoch so a key
//! from an earlier set (detached when its round completed or was abandoned)
//! never matches an entry of a later set that happens to reuse the slot.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{Error, Result};
use crate::sync::deferred::{Completer, Deferred};
use crate::util::{Slab, SlotKey};

/// One caller's outstanding interest in a lazy cell's result.
pub(crate) struct Request<T> {
    completer: Completer<T>,
    token: CancelToken,
    registration: Mutex<Option<CancelRegistration>>,
}

impl<T> Request<T> {
    /// Creates a request observed through the returned [`Deferred`].
    pub(crate) fn new(token: CancelToken) -> (Arc<Self>, Deferred<T>) {
        let (completer, deferred) = Deferred::pending();
        let request = Arc::new(Self {
            completer,
            token,
            registration: Mutex::new(None),
        });
        (request, deferred)
    }

    /// The caller's cancellation token.
    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Stores the cancellation registration.
    ///
    /// If the request completed in the meantime the registration is released
    /// immediately.
    pub(crate) fn attach_registration(&self, registration: CancelRegistration) {
        let stale = {
            let mut slot = self.registration.lock();
            if self.completer.is_completed() {
                Some(registration)
            } else {
                *slot = Some(registration);
                None
            }
        };
        drop(stale);
    }

    /// Completes with cancellation.
    pub(crate) fn cancel(&self) -> bool {
        self.complete(Err(Error::cancelled()))
    }

    /// Completes the request. First writer wins.
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        let won = self.completer.complete(result);
        self.release_registration();
        won
    }

    fn release_registration(&self) {
        let registration = self.registration.lock().take();
        drop(registration);
    }
}

impl<T: Clone> Request<T> {
    /// Completes from a round's shared result.
    ///
    /// A caller whose own token already fired observes cancellation rather
    /// than the round's result.
    pub(crate) fn complete_from(&self, result: &Result<T>) -> bool {
        if self.token.is_cancelled() {
            self.cancel()
        } else {
            self.complete(result.clone())
        }
    }
}

/// Identifies a request inside the [`RequestSet`] of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequestKey {
    epoch: u64,
    slot: SlotKey,
}

/// The requests outstanding for the current computation.
pub(crate) struct RequestSet<T> {
    epoch: u64,
    entries: Slab<Arc<Request<T>>>,
}

impl<T> RequestSet<T> {
    pub(crate) fn new(epoch: u64) -> Self {
        Self {
            epoch,
            entries: Slab::new(),
        }
    }

    pub(crate) fn insert(&mut self, request: Arc<Request<T>>) -> RequestKey {
        RequestKey {
            epoch: self.epoch,
            slot: self.entries.insert(request),
        }
    }

    /// Removes a request. Keys from another epoch are ignored.
    pub(crate) fn remove(&mut self, key: RequestKey) -> Option<Arc<Request<T>>> {
        if key.epoch != self.epoch {
            return None;
        }
        self.entries.remove(key.slot)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the set, yielding its requests in slot order.
    pub(crate) fn into_requests(mut self) -> Vec<Arc<Request<T>>> {
        self.entries.take_all()
    }
}
