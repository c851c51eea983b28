//! Cancellation signals.
//!
//! A [`CancelSource`] owns the right to fire a signal; [`CancelToken`]s are
//! cheap clones handed to the parties that only observe it. Observers either
//! poll [`CancelToken::is_cancelled`], await [`CancelToken::cancelled`], or
//! register a one-shot callback with [`CancelToken::register`].
//!
//! # Reentrancy
//!
//! Callbacks never run while the signal's internal lock is held. Registering
//! on a signal that already fired runs the callback immediately on the
//! registering thread, so callers must not hold their own locks across
//! `register`.

mod token;

pub use token::{CancelRegistration, CancelSource, CancelToken, WaitCancelled};
