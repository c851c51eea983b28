//! Coalescing lazy cell and the primitives it is built from.
//!
//! # Primitives
//!
//! - [`Deferred`] / [`Completer`]: one-shot result consumable by blocking
//!   or async callers
//! - [`AsyncLazy`]: memoizing cell that coalesces concurrent callers onto a
//!   single cancellable computation
//!
//! # Cancel Safety
//!
//! - Cancelling one caller completes only that caller's request
//! - The computation is cancelled once no caller is left waiting for it
//! - A caller arriving after a cancelled computation starts a new one

mod async_lazy;
mod deferred;
mod request;

pub use async_lazy::{AsyncLazy, AsyncLazyBuilder};
pub use deferred::{Completer, Deferred};
