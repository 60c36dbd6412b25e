//! Periodic ping scheduling and pong round-trip measurement.
//!
//! Mirrors the reference implementation's `_send_ping`: schedule a ping,
//! wait up to `client_timeout` for its pong, close on timeout, and
//! reschedule on success. A 13-protocol WebSocket uses a control-frame ping
//! carrying an 8-byte timestamp token; anything else falls back to the
//! application-level RPC `call('ping', ...)`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::pack_ping_token;
use crate::error::RpcError;

/// Tracks in-flight pings for one session and reports whether the most
/// recent one succeeded, timed out, or is still outstanding.
pub struct KeepAlive {
    keepalive_timeout: Duration,
    client_timeout: Duration,
    next_token: AtomicI64,
    inflight: dashmap::DashMap<i64, oneshot::Sender<()>>,
}

/// Outcome of one ping/pong round trip.
#[derive(Debug)]
pub enum PingOutcome {
    /// Pong arrived within `client_timeout`; contains the measured round trip.
    Ok(Duration),
    /// No pong arrived before `client_timeout` elapsed.
    TimedOut,
}

impl KeepAlive {
    /// Build a keepalive tracker from session-level timeouts.
    pub fn new(keepalive_timeout: Duration, client_timeout: Duration) -> Self {
        Self {
            keepalive_timeout,
            client_timeout,
            next_token: AtomicI64::new(0),
            inflight: dashmap::DashMap::new(),
        }
    }

    /// How long to wait between pings.
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    /// How long to wait for a pong (control-frame or RPC) before timing out.
    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    /// Begin tracking a new ping, returning its 8-byte control-frame token.
    ///
    /// Callers await [`KeepAlive::wait_for_pong`] with the same token to
    /// learn the outcome.
    pub fn start_ping(&self) -> ([u8; 8], oneshot::Receiver<()>) {
        let millis = now_millis();
        let (tx, rx) = oneshot::channel();
        self.inflight.insert(millis, tx);
        (pack_ping_token(millis), rx)
    }

    /// Record that a pong for `token` arrived, waking any waiter.
    ///
    /// Silently ignored if the token is unknown (e.g. a stray or duplicate
    /// pong, or one that arrived after this ping was already timed out).
    pub fn record_pong(&self, token_millis: i64) {
        if let Some((_, tx)) = self.inflight.remove(&token_millis) {
            let _ = tx.send(());
        }
    }

    /// Wait for the pong matching a ping started with [`KeepAlive::start_ping`],
    /// bounded by `client_timeout`, and compute the round trip on success.
    pub async fn wait_for_pong(&self, sent_at_millis: i64, rx: oneshot::Receiver<()>) -> PingOutcome {
        match tokio::time::timeout(self.client_timeout, rx).await {
            Ok(Ok(())) => {
                let delta_millis = now_millis().saturating_sub(sent_at_millis).max(0);
                PingOutcome::Ok(Duration::from_millis(delta_millis as u64))
            }
            Ok(Err(_)) | Err(_) => {
                self.inflight.remove(&sent_at_millis);
                PingOutcome::TimedOut
            }
        }
    }

    /// Allocate a float-seconds `seq` token for the RPC-fallback ping path,
    /// used when the transport is not a protocol-13 WebSocket and a control
    /// frame ping/pong is unavailable.
    pub fn next_fallback_seq(&self) -> f64 {
        self.next_token.fetch_add(1, Ordering::Relaxed) as f64
    }
}

/// Whether `data` is a shape the RPC-fallback ping accepts as a pong: a bare
/// `"pong"` string (what the built-in `ping` route returns) or a `{seq: ...}`
/// object (what older peers echo back instead).
pub fn is_pong_reply(data: &Value) -> bool {
    match data {
        Value::String(s) => s == "pong",
        Value::Object(map) => map.contains_key("seq"),
        _ => false,
    }
}

impl std::fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAlive")
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("client_timeout", &self.client_timeout)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

impl PingOutcome {
    /// Convert to a `Result`, producing [`RpcError::PingTimeout`] carrying
    /// the timeout that was configured for this round trip.
    pub fn into_result(self, configured_timeout: Duration) -> Result<Duration, RpcError> {
        match self {
            PingOutcome::Ok(delta) => Ok(delta),
            PingOutcome::TimedOut => Err(RpcError::PingTimeout(configured_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pong_within_timeout_reports_ok() {
        let keepalive = KeepAlive::new(Duration::from_secs(30), Duration::from_millis(200));
        let (token, rx) = keepalive.start_ping();
        let sent_at = crate::codec::unpack_ping_token(&token).unwrap();
        keepalive.record_pong(sent_at);
        assert!(matches!(
            keepalive.wait_for_pong(sent_at, rx).await,
            PingOutcome::Ok(_)
        ));
    }

    #[tokio::test]
    async fn missing_pong_times_out() {
        let keepalive = KeepAlive::new(Duration::from_secs(30), Duration::from_millis(20));
        let (token, rx) = keepalive.start_ping();
        let sent_at = crate::codec::unpack_ping_token(&token).unwrap();
        assert!(matches!(
            keepalive.wait_for_pong(sent_at, rx).await,
            PingOutcome::TimedOut
        ));
    }

    #[tokio::test]
    async fn stray_pong_for_unknown_token_is_ignored() {
        let keepalive = KeepAlive::new(Duration::from_secs(30), Duration::from_millis(200));
        keepalive.record_pong(999_999);
    }

    #[test]
    fn into_result_produces_ping_timeout_on_timed_out() {
        let err = PingOutcome::TimedOut
            .into_result(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, RpcError::PingTimeout(d) if d == Duration::from_millis(10)));
    }

    #[test]
    fn into_result_passes_through_the_round_trip_on_ok() {
        let delta = PingOutcome::Ok(Duration::from_millis(5))
            .into_result(Duration::from_millis(10))
            .unwrap();
        assert_eq!(delta, Duration::from_millis(5));
    }

    #[test]
    fn is_pong_reply_accepts_bare_pong_string() {
        assert!(is_pong_reply(&Value::String("pong".to_string())));
        assert!(!is_pong_reply(&Value::String("nope".to_string())));
    }

    #[test]
    fn is_pong_reply_accepts_seq_object() {
        assert!(is_pong_reply(&serde_json::json!({"seq": 1.0})));
        assert!(!is_pong_reply(&serde_json::json!({"other": 1})));
        assert!(!is_pong_reply(&Value::Null));
    }
}
