//! Handler dispatch strategies.
//!
//! Rust's single `Future` type already erases the sync-vs-Future distinction
//! the reference implementation's `WebSocket`/`WebSocketThreaded` classes
//! juggle at runtime (see `DESIGN.md`); what's left for the executor to
//! decide is *where* a handler's future is driven — inline as an ordinary
//! task, or behind the bounded worker pool's semaphore.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;

use crate::config::ExecutorKind;
use crate::error::{RpcError, RpcResult};
use crate::pool::WorkerPool;

/// Runs handler futures to completion under one of the two dispatch strategies.
#[derive(Debug, Clone, Copy)]
pub struct Executor {
    kind: ExecutorKind,
}

impl Executor {
    /// Build an executor for the given strategy.
    pub fn new(kind: ExecutorKind) -> Self {
        Self { kind }
    }

    /// Run `handler`, catching panics into [`RpcError::TaskPanicked`] rather
    /// than letting them tear down the dispatch loop.
    ///
    /// Cooperative dispatch spawns `handler` as an ordinary task, scheduled
    /// freely alongside the rest of the runtime's work. Threaded dispatch
    /// instead spawns it through the shared [`WorkerPool`]'s bounded
    /// semaphore, which is what actually matters to an embedder offloading
    /// CPU-heavy handlers: not which OS thread runs it, but how many may run
    /// at once.
    pub async fn run<F>(&self, handler: F) -> RpcResult<Value>
    where
        F: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        match self.kind {
            ExecutorKind::Cooperative => run_catching_panics(handler).await,
            ExecutorKind::Threaded => WorkerPool::get().run(run_catching_panics(handler)).await?,
        }
    }
}

async fn run_catching_panics<F>(handler: F) -> RpcResult<Value>
where
    F: Future<Output = RpcResult<Value>> + Send + 'static,
{
    match tokio::spawn(AssertUnwindSafe(handler).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(RpcError::TaskPanicked(describe_panic(panic))),
        Err(join_err) => Err(RpcError::from(join_err)),
    }
}

fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
