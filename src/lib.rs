//! lazy-coalesce: a cancel-correct, memoizing lazy cell for Rust.
//!
//! # Overview
//!
//! An [`AsyncLazy`] computes a value once and shares it with every caller.
//! Callers that arrive while the value is being computed are coalesced onto
//! the running computation instead of starting their own. Each caller may
//! cancel independently; the computation itself is only cancelled once every
//! caller has lost interest.
//!
//! # Core Guarantees
//!
//! - **At most one live computation**: per cell, at any time
//! - **Memoization**: a successful result is cached permanently and the
//!   compute functions are released
//! - **Cancellation independence**: one caller cancelling never affects the
//!   others
//! - **Failure fan-out**: every caller of a failed round observes the same
//!   underlying error
//! - **Blocking/async interop**: blocking callers and async callers wait on
//!   the same [`Deferred`] abstraction
//!
//! # Module Structure
//!
//! - [`sync`]: The lazy cell and its deferred result
//! - [`cancel`]: Cancellation sources, tokens and registrations
//! - [`runtime`]: Background execution ([`Spawn`], [`BackgroundPool`])
//! - [`error`]: Error types
//! - [`util`]: Internal utilities (slot arena)
//! - [`tracing_compat`]: Structured logging shim

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod cancel;
pub mod error;
pub mod runtime;
pub mod sync;
pub mod tracing_compat;
pub mod util;

#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use cancel::{CancelRegistration, CancelSource, CancelToken, WaitCancelled};
pub use error::{Error, ErrorKind, Result};
pub use runtime::{BackgroundPool, ConfigError, PoolConfig, Spawn};
pub use sync::{AsyncLazy, AsyncLazyBuilder, Completer, Deferred};
