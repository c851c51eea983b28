//! Error types for lazy cells and their collaborators.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - A compute failure is shared, not copied: every waiter of one round
//!   receives a clone of the same [`Error`], and clones share the source
//! - Panics inside a computation are caught and surfaced as
//!   [`ErrorKind::Panicked`]
//! - Internal contract violations are panics, never values of this type
//!
//! # Failure identity
//!
//! Because [`Error`] keeps its source behind an [`Arc`], two errors handed to
//! two different waiters can be checked for identity with
//! [`Error::same_failure`]. This is how fan-out of a single failure to many
//! requesters is observable.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller's cancellation signal fired, or the computation gave up
    /// because it was cancelled.
    Cancelled,
    /// The compute function reported a failure.
    Failed,
    /// The compute function panicked.
    Panicked,
    /// The background execution context refused the computation.
    Spawn,
    /// Internal error (bug or broken collaborator).
    Internal,
}

impl ErrorKind {
    /// Returns true if the condition is transient rather than a property of
    /// the computation itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Spawn)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "computation failed"),
            Self::Panicked => write!(f, "computation panicked"),
            Self::Spawn => write!(f, "spawn failed"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// The main error type for lazy cell operations.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Wraps a compute failure.
    ///
    /// The source is stored once; every clone of the returned error refers
    /// to the same allocation.
    #[must_use]
    pub fn failed(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Failed).with_source(source)
    }

    /// Creates a failure from a plain message.
    #[must_use]
    pub fn failed_msg(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed).with_message(msg)
    }

    /// Converts a panic payload caught at a poll or call boundary.
    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&'static str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(ErrorKind::Panicked).with_message(detail)
    }

    /// Creates a spawn error.
    #[must_use]
    pub fn spawn(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Spawn).with_message(detail)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if both errors stem from the same failure.
    ///
    /// Errors with a source compare by source identity. Errors without one
    /// compare by kind and message.
    #[must_use]
    pub fn same_failure(&self, other: &Self) -> bool {
        match (&self.source, &other.source) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => self.kind == other.kind && self.message == other.message,
            _ => false,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("kind", &self.kind);
        if let Some(msg) = &self.message {
            d.field("message", msg);
        }
        if let Some(source) = &self.source {
            d.field("source", &format_args!("{source}"));
        }
        d.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        } else if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for lazy cell operations.
pub type Result<T> = core::result::Result<T, Error>;
