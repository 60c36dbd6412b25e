//! The bounded worker pool backing the threaded [`crate::executor::Executor`].
//!
//! A single pool is shared by every session that opts into threaded
//! dispatch, created lazily the first time one is needed — mirroring the
//! reference implementation's `WebSocketThreaded.init_pool`, which likewise
//! lazily constructs a class-wide thread pool on first use. This is the one
//! deliberate global-mutable-state exception recorded in `DESIGN.md`; every
//! other shared table in this crate is an explicit `Arc` threaded through at
//! construction instead.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::Semaphore;

use crate::config::SessionConfig;
use crate::error::RpcResult;

/// A concurrency-bounded pool for running handler work that should not share
/// the event loop's scheduling slot with ordinary cooperative tasks.
///
/// There is no separate OS thread pool here: offloaded work still runs as a
/// tokio task on the shared runtime. The semaphore bounds how many such tasks
/// may be in flight at once, which is the property an embedder offloading
/// CPU-heavy handlers actually depends on, not which thread executes them.
#[derive(Debug)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// The process-wide pool, sized from [`crate::config::init_pool`] (or the
    /// built-in default) on first access.
    pub fn get() -> &'static WorkerPool {
        static POOL: OnceLock<WorkerPool> = OnceLock::new();
        POOL.get_or_init(|| WorkerPool::new(SessionConfig::pool_workers()))
    }

    /// Run `work` once a pool slot is free.
    ///
    /// Panics inside `work` surface as a [`tokio::task::JoinError`], which
    /// callers convert to [`crate::error::RpcError::TaskPanicked`] via `?`.
    pub async fn run<F>(&self, work: F) -> Result<RpcResult<serde_json::Value>, tokio::task::JoinError>
    where
        F: Future<Output = RpcResult<serde_json::Value>> + Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");
        tokio::spawn(async move {
            let _permit = permit;
            work.await
        })
        .await
    }

    /// Current number of slots available for new work.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}
