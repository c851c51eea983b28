//! Background execution for asynchronous computations.
//!
//! - [`Spawn`]: the seam a lazy cell uses to run a computation that did not
//!   settle on the caller's thread
//! - [`BackgroundPool`]: the default [`Spawn`] implementation
//! - [`PoolConfig`]: pool sizing with `LAZY_COALESCE_*` environment overrides
//! - [`global`]: the process-wide pool used when a cell has no spawner of
//!   its own

pub mod config;
mod pool;

pub use config::{ConfigError, PoolConfig};
pub use pool::BackgroundPool;

use std::sync::{Arc, OnceLock};

use futures_lite::future::Boxed;

use crate::error::Result;
use crate::tracing_compat::{debug, warn};

/// Executes type-erased futures to completion off the caller's thread.
pub trait Spawn: Send + Sync + 'static {
    /// Schedules `task`.
    ///
    /// An `Err` means the task will never be polled.
    fn spawn(&self, task: Boxed<()>) -> Result<()>;
}

static GLOBAL_POOL: OnceLock<Arc<BackgroundPool>> = OnceLock::new();

/// Returns the process-wide background pool, creating it on first use.
///
/// The pool is configured from [`PoolConfig::from_env`]. Invalid overrides
/// are logged and the defaults are used instead.
pub fn global() -> Arc<BackgroundPool> {
    Arc::clone(GLOBAL_POOL.get_or_init(|| {
        let config = match PoolConfig::from_env().and_then(|c| c.validate().map(|()| c)) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "invalid background pool configuration; using defaults");
                PoolConfig::default()
            }
        };
        debug!(
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            "starting global background pool"
        );
        Arc::new(BackgroundPool::from_validated(config))
    }))
}
