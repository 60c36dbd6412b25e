//! Process-wide and per-session configuration.
//!
//! Two layers mirror the two configuration surfaces the wire protocol exposes:
//! a process-wide class (`configure`, `init_pool`, set once near startup) and a
//! per-session builder (`SessionConfig`) that snapshots the process-wide
//! defaults at construction time and allows per-session overrides on top.

use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;

/// Default keepalive ping interval.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default round-trip timeout for a single ping/pong.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum size of a single inbound frame, before JSON parsing.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Default worker pool size when `init_pool` is never called.
pub const DEFAULT_POOL_WORKERS: usize = 4;

#[derive(Debug, Clone)]
struct GlobalDefaults {
    keepalive_timeout: Duration,
    client_timeout: Duration,
    pool_workers: usize,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        Self {
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            pool_workers: DEFAULT_POOL_WORKERS,
        }
    }
}

fn global_defaults() -> &'static Mutex<GlobalDefaults> {
    static DEFAULTS: OnceLock<Mutex<GlobalDefaults>> = OnceLock::new();
    DEFAULTS.get_or_init(|| Mutex::new(GlobalDefaults::default()))
}

/// Set the class-wide keepalive cadence and pong timeout.
///
/// Applies to sessions constructed after this call; sessions already open
/// keep the timeouts they were built with.
pub fn configure(keepalive_timeout: Duration, client_timeout: Duration) {
    let mut defaults = global_defaults().lock();
    defaults.keepalive_timeout = keepalive_timeout;
    defaults.client_timeout = client_timeout;
}

/// Set the number of workers the lazily-created threaded executor pool should use.
///
/// Has no effect once the pool has already been created by a prior threaded
/// dispatch (see [`crate::pool::WorkerPool::get`]).
pub fn init_pool(workers: usize) {
    global_defaults().lock().pool_workers = workers;
}

/// Which dispatch strategy a session uses for its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorKind {
    /// Run handlers inline as ordinary tasks on the async runtime.
    #[default]
    Cooperative,
    /// Run handlers on the bounded worker pool.
    Threaded,
}

/// Which transport the keepalive loop uses to ping the peer.
///
/// The reference implementation picks this per-connection by sniffing the
/// negotiated WebSocket protocol version (13 gets a control-frame ping;
/// anything older falls back to the application-level `call('ping', ...)`
/// RPC). This crate's [`crate::session::FrameSink`] abstraction has no notion
/// of protocol version, so the choice is an explicit, embedder-set
/// configuration flag instead of something sniffed from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingMode {
    /// Send an 8-byte control-frame ping and await a pong.
    #[default]
    ControlFrame,
    /// Send an application-level `call('ping', {seq})` and await its reply.
    Rpc,
}

/// Per-session configuration, resolved from process-wide defaults plus overrides.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keepalive pings.
    pub keepalive_timeout: Duration,
    /// Maximum time to wait for a ping's pong before closing the session.
    pub client_timeout: Duration,
    /// Maximum size, in bytes, of a single inbound frame before it is parsed.
    pub max_frame_bytes: usize,
    /// Whether permessage-deflate may be used on this session.
    pub compression: bool,
    /// Which executor strategy handlers run under.
    pub executor: ExecutorKind,
    /// Which transport the keepalive loop uses to ping the peer.
    pub ping_mode: PingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = global_defaults().lock().clone();
        Self {
            keepalive_timeout: defaults.keepalive_timeout,
            client_timeout: defaults.client_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            compression: false,
            executor: ExecutorKind::default(),
            ping_mode: PingMode::default(),
        }
    }
}

impl SessionConfig {
    /// Start a builder seeded with the current process-wide defaults.
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// The worker pool size configured via [`init_pool`], or the built-in default.
    #[must_use]
    pub fn pool_workers() -> usize {
        global_defaults().lock().pool_workers
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    keepalive_timeout: Option<Duration>,
    client_timeout: Option<Duration>,
    max_frame_bytes: Option<usize>,
    compression: Option<bool>,
    executor: Option<ExecutorKind>,
    ping_mode: Option<PingMode>,
}

impl SessionConfigBuilder {
    /// Override the keepalive ping interval.
    #[must_use]
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = Some(timeout);
        self
    }

    /// Override the ping/pong round-trip timeout.
    #[must_use]
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = Some(timeout);
        self
    }

    /// Override the maximum inbound frame size, in bytes.
    #[must_use]
    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = Some(bytes);
        self
    }

    /// Enable or disable permessage-deflate for this session.
    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = Some(enabled);
        self
    }

    /// Select the dispatch strategy for this session's handlers.
    #[must_use]
    pub fn executor(mut self, kind: ExecutorKind) -> Self {
        self.executor = Some(kind);
        self
    }

    /// Select how the keepalive loop pings the peer.
    #[must_use]
    pub fn ping_mode(mut self, mode: PingMode) -> Self {
        self.ping_mode = Some(mode);
        self
    }

    /// Build the session configuration, falling back to process-wide defaults
    /// for anything not overridden.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        let base = SessionConfig::default();
        SessionConfig {
            keepalive_timeout: self.keepalive_timeout.unwrap_or(base.keepalive_timeout),
            client_timeout: self.client_timeout.unwrap_or(base.client_timeout),
            max_frame_bytes: self.max_frame_bytes.unwrap_or(base.max_frame_bytes),
            compression: self.compression.unwrap_or(base.compression),
            executor: self.executor.unwrap_or(base.executor),
            ping_mode: self.ping_mode.unwrap_or(base.ping_mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_win_over_defaults() {
        let cfg = SessionConfig::builder()
            .client_timeout(Duration::from_millis(250))
            .compression(true)
            .executor(ExecutorKind::Threaded)
            .build();
        assert_eq!(cfg.client_timeout, Duration::from_millis(250));
        assert!(cfg.compression);
        assert_eq!(cfg.executor, ExecutorKind::Threaded);
    }

    #[test]
    fn default_config_has_no_compression() {
        assert!(!SessionConfig::default().compression);
    }

    #[test]
    fn default_ping_mode_is_control_frame() {
        assert_eq!(SessionConfig::default().ping_mode, PingMode::ControlFrame);
    }

    #[test]
    fn ping_mode_override_wins() {
        let cfg = SessionConfig::builder().ping_mode(PingMode::Rpc).build();
        assert_eq!(cfg.ping_mode, PingMode::Rpc);
    }
}
