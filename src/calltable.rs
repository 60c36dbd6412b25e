//! Outbound call correlation and per-serial inbound mutual exclusion.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, oneshot};

use crate::error::RpcError;

/// The terminal result of an outbound call: what the serial's `callback`/
/// `error` frame resolved it to, or why it was cancelled.
pub type PendingResult = Result<Value, RpcError>;

/// Tracks outbound calls awaiting a remote `callback`/`error`, and serializes
/// inbound frame handling per serial.
///
/// `initial_serial`/`step` let a session pick its half of the two independent
/// serial spaces described in the wire protocol: servers allocate even
/// serials, clients odd, each incrementing by 2 so the two spaces never
/// collide on one connection.
pub struct CallTable {
    next_serial: AtomicI64,
    step: i64,
    pending: DashMap<i64, oneshot::Sender<PendingResult>>,
    inbound_locks: Arc<DashMap<i64, Arc<AsyncMutex<()>>>>,
    lock_eviction_delay: Duration,
}

impl CallTable {
    /// Build a table that allocates serials starting at `initial_serial`,
    /// incrementing by `step` (2, per the wire protocol's parity convention).
    pub fn new(initial_serial: i64, step: i64, lock_eviction_delay: Duration) -> Self {
        Self {
            next_serial: AtomicI64::new(initial_serial),
            step,
            pending: DashMap::new(),
            inbound_locks: Arc::new(DashMap::new()),
            lock_eviction_delay,
        }
    }

    /// Allocate the next outbound serial and register a pending result slot for it.
    pub fn register(&self) -> (i64, oneshot::Receiver<PendingResult>) {
        let serial = self.next_serial.fetch_add(self.step, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(serial, tx);
        (serial, rx)
    }

    /// Resolve the pending call for `serial` with a successful result.
    ///
    /// Drops silently (after logging) if no call with that serial is
    /// outstanding — the peer may be replying to a call this session already
    /// gave up on.
    pub fn complete(&self, serial: i64, data: Value) {
        match self.pending.remove(&serial) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(data));
            }
            None => tracing::warn!(serial, "callback for unknown or already-resolved serial"),
        }
    }

    /// Reject the pending call for `serial` with the peer's reported error.
    pub fn reject(&self, serial: i64, data: Value) {
        match self.pending.remove(&serial) {
            Some((_, tx)) => {
                let (kind, message) = split_error_payload(data);
                let _ = tx.send(Err(RpcError::HandlerError { kind, message }));
            }
            None => tracing::warn!(serial, "error for unknown or already-resolved serial"),
        }
    }

    /// Cancel every outstanding pending call, e.g. on session close.
    pub fn cancel_all(&self, reason: &str) {
        let serials: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for serial in serials {
            if let Some((_, tx)) = self.pending.remove(&serial) {
                let _ = tx.send(Err(RpcError::ConnectionClosed(reason.to_string())));
            }
        }
    }

    /// Acquire exclusive access to process an inbound frame with this serial.
    ///
    /// The returned guard is held for the duration of dispatching that one
    /// frame; releasing it schedules the per-serial lock for eviction after
    /// `lock_eviction_delay` so long-lived sessions do not accumulate
    /// unbounded lock state, per the spec's "prefer queueing" resolution over
    /// outright rejecting a duplicate in-flight serial.
    pub async fn inbound_guard(&self, serial: i64) -> InboundGuard {
        let mutex = self
            .inbound_locks
            .entry(serial)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        InboundGuard {
            serial,
            locks: Arc::clone(&self.inbound_locks),
            delay: self.lock_eviction_delay,
            _guard: guard,
        }
    }
}

impl std::fmt::Debug for CallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTable")
            .field("outstanding", &self.pending.len())
            .finish()
    }
}

fn split_error_payload(data: Value) -> (String, String) {
    match data {
        Value::Object(map) => {
            let kind = map
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("Error")
                .to_string();
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (kind, message)
        }
        Value::String(message) => ("Error".to_string(), message),
        other => ("Error".to_string(), other.to_string()),
    }
}

/// Holds the per-serial lock for the duration of processing one inbound frame.
pub struct InboundGuard {
    serial: i64,
    locks: Arc<DashMap<i64, Arc<AsyncMutex<()>>>>,
    delay: Duration,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for InboundGuard {
    fn drop(&mut self) {
        let serial = self.serial;
        let locks = Arc::clone(&self.locks);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(entry) = locks.get(&serial) {
                // Only the map's own reference remains: nobody queued behind it.
                if Arc::strong_count(entry.value()) == 1 {
                    drop(entry);
                    locks.remove(&serial);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serials_increment_by_step_from_initial() {
        let table = CallTable::new(0, 2, Duration::from_millis(10));
        let (a, _) = table.register();
        let (b, _) = table.register();
        let (c, _) = table.register();
        assert_eq!([a, b, c], [0, 2, 4]);
    }

    #[tokio::test]
    async fn complete_resolves_the_matching_pending_call() {
        let table = CallTable::new(1, 2, Duration::from_millis(10));
        let (serial, rx) = table.register();
        table.complete(serial, serde_json::json!({"ok": true}));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn reject_carries_type_and_message() {
        let table = CallTable::new(1, 2, Duration::from_millis(10));
        let (serial, rx) = table.register();
        table.reject(
            serial,
            serde_json::json!({"type": "ValueError", "message": "bad"}),
        );
        match rx.await.unwrap() {
            Err(RpcError::HandlerError { kind, message }) => {
                assert_eq!(kind, "ValueError");
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_all_rejects_every_outstanding_call() {
        let table = CallTable::new(1, 2, Duration::from_millis(10));
        let (_, rx1) = table.register();
        let (_, rx2) = table.register();
        table.cancel_all("socket closed");
        assert!(matches!(
            rx1.await.unwrap(),
            Err(RpcError::ConnectionClosed(_))
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(RpcError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn inbound_guard_serializes_same_serial() {
        let table = Arc::new(CallTable::new(0, 2, Duration::from_millis(5)));
        let order = Arc::new(AsyncMutex::new(Vec::<u32>::new()));

        let t1 = {
            let table = Arc::clone(&table);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _g = table.inbound_guard(7).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                order.lock().await.push(1);
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let t2 = {
            let table = Arc::clone(&table);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _g = table.inbound_guard(7).await;
                order.lock().await.push(2);
            })
        };

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*order.lock().await, vec![1, 2]);
    }
}
