//! The per-connection session state machine and dispatch loop.
//!
//! A [`Session`] owns one connection's [`CallTable`], route instance cache,
//! and keepalive tracker, and drives the message loop described in the
//! component design: decode → (by frame type) resolve/complete/reject →
//! encode. Sending and receiving are abstracted behind [`FrameSink`] and
//! [`FrameSource`] so this module can be exercised against an in-process
//! mock transport in tests and against a real WebSocket in [`crate::http`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use uuid::Uuid;

use crate::calltable::CallTable;
use crate::codec::{self, Frame};
use crate::config::{PingMode, SessionConfig};
use crate::error::{RpcError, RpcResult};
use crate::executor::Executor;
use crate::keepalive::{self, KeepAlive};
use crate::registry::ConnectionRegistry;
use crate::route::{Resolved, RouteInstanceCache, RouteRegistry};

/// One frame received off the wire, already demultiplexed from the
/// transport's own framing (text vs binary vs control).
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// A plain-text frame, not compressed.
    Text(String),
    /// A permessage-deflate-compressed frame.
    Binary(Vec<u8>),
    /// A pong for an earlier keepalive ping, carrying back its token.
    Pong([u8; 8]),
}

/// The write half of a connection. Implementations are expected to be
/// internally synchronized (an `Arc<Mutex<…>>`-wrapped sink, as in the
/// reference websocket adapter), since pings and outbound calls may both
/// want to send concurrently with the dispatch loop's own responses.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send a plain-text frame.
    async fn send_text(&self, text: String) -> RpcResult<()>;
    /// Send a compressed (binary) frame.
    async fn send_binary(&self, data: Vec<u8>) -> RpcResult<()>;
    /// Send a control-frame ping carrying the given payload.
    async fn send_ping(&self, payload: [u8; 8]) -> RpcResult<()>;
    /// Close the underlying connection.
    async fn close(&self);
}

/// The read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Await the next inbound frame, or `None` once the connection ends.
    async fn recv(&mut self) -> Option<InboundFrame>;
}

/// Why a session's teardown path was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The underlying transport closed (peer disconnect, network error).
    TransportClosed,
    /// A keepalive ping did not receive a pong in time.
    PingTimeout,
    /// `Session::close` was called explicitly.
    Explicit,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::TransportClosed => "transport closed",
            CloseReason::PingTimeout => "ping timeout",
            CloseReason::Explicit => "closed explicitly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closing,
    Closed,
}

/// A non-owning reference to a [`Session`], handed to route factories and
/// bare functions so they can make outbound calls without creating an
/// ownership cycle between the session and its routes (see `DESIGN.md`).
#[derive(Clone)]
pub struct SessionHandle(Weak<Session>);

impl SessionHandle {
    /// The session's id, if it still exists.
    pub fn id(&self) -> Option<String> {
        self.0.upgrade().map(|session| session.id.clone())
    }

    /// Make an outbound call on the underlying session.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] if the session has already
    /// been dropped.
    pub async fn call(&self, name: impl Into<String>, args: Value) -> RpcResult<Value> {
        match self.0.upgrade() {
            Some(session) => session.call(name, args).await,
            None => Err(RpcError::ConnectionClosed(
                "session no longer exists".into(),
            )),
        }
    }
}

/// The per-connection state machine.
pub struct Session {
    id: String,
    config: SessionConfig,
    call_table: CallTable,
    route_instances: RouteInstanceCache,
    registry: Arc<RouteRegistry>,
    sink: Arc<dyn FrameSink>,
    executor: Executor,
    keepalive: KeepAlive,
    state: AsyncMutex<SessionState>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl Session {
    /// Build a new session. `is_server` selects this connection's half of the
    /// wire protocol's serial parity: servers allocate even serials
    /// (0, 2, 4, …), clients odd (1, 3, 5, …).
    pub fn new(
        is_server: bool,
        config: SessionConfig,
        registry: Arc<RouteRegistry>,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Self> {
        let initial_serial = if is_server { 0 } else { 1 };
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            call_table: CallTable::new(initial_serial, 2, config.client_timeout),
            keepalive: KeepAlive::new(config.keepalive_timeout, config.client_timeout),
            executor: Executor::new(config.executor),
            route_instances: RouteInstanceCache::new(),
            registry,
            sink,
            state: AsyncMutex::new(SessionState::Open),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            config,
        })
    }

    /// This session's opaque identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// A non-owning handle to this session.
    pub fn handle(self: &Arc<Self>) -> SessionHandle {
        SessionHandle(Arc::downgrade(self))
    }

    /// Run the dispatch loop against `source` until the transport ends or
    /// the session is explicitly closed, registering and deregistering this
    /// session in `connections` around the run.
    pub async fn run(
        self: &Arc<Self>,
        mut source: impl FrameSource + 'static,
        connections: &Arc<ConnectionRegistry>,
    ) {
        connections.insert(Arc::clone(self));
        tracing::debug!(session = %self.id, "session open");

        let keepalive_task = {
            let session = Arc::clone(self);
            let connections = Arc::clone(connections);
            tokio::spawn(async move { session.keepalive_loop(connections).await })
        };

        loop {
            tokio::select! {
                frame = source.recv() => {
                    match frame {
                        Some(frame) => {
                            if self.closed.load(Ordering::SeqCst) {
                                break;
                            }
                            self.handle_inbound(frame).await;
                        }
                        None => break,
                    }
                }
                () = self.closed_notify.notified() => break,
            }
        }

        keepalive_task.abort();
        self.close(CloseReason::TransportClosed, connections).await;
    }

    async fn handle_inbound(self: &Arc<Self>, frame: InboundFrame) {
        match frame {
            InboundFrame::Pong(token) => {
                let millis = i64::from_be_bytes(token);
                self.keepalive.record_pong(millis);
            }
            InboundFrame::Text(text) => self.handle_text(text).await,
            InboundFrame::Binary(data) => match codec::inflate(&data) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => self.handle_text(text).await,
                    Err(err) => tracing::warn!(session = %self.id, %err, "inflated frame was not valid utf-8"),
                },
                Err(err) => tracing::warn!(session = %self.id, %err, "failed to inflate frame"),
            },
        }
    }

    async fn keepalive_loop(self: Arc<Self>, connections: Arc<ConnectionRegistry>) {
        loop {
            tokio::time::sleep(self.keepalive.keepalive_timeout()).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.config.ping_mode {
                PingMode::ControlFrame => {
                    if !self.send_control_ping(&connections).await {
                        return;
                    }
                }
                PingMode::Rpc => {
                    if !self.send_rpc_ping(&connections).await {
                        return;
                    }
                }
            }
        }
    }

    /// Send a control-frame ping and await its pong. Returns `false` if the
    /// session was closed (transport failure or timeout) and the keepalive
    /// loop should stop.
    async fn send_control_ping(self: &Arc<Self>, connections: &Arc<ConnectionRegistry>) -> bool {
        let (token, rx) = self.keepalive.start_ping();
        if self.sink.send_ping(token).await.is_err() {
            self.close(CloseReason::TransportClosed, connections).await;
            return false;
        }
        let sent_at = i64::from_be_bytes(token);
        match self
            .keepalive
            .wait_for_pong(sent_at, rx)
            .await
            .into_result(self.config.client_timeout)
        {
            Ok(delta) => {
                tracing::trace!(session = %self.id, ?delta, "pong received");
                true
            }
            Err(err) => {
                tracing::warn!(session = %self.id, %err, "ping timed out, closing session");
                self.close(CloseReason::PingTimeout, connections).await;
                false
            }
        }
    }

    /// Fall back to the application-level `call('ping', {seq})` keepalive
    /// path, for peers that don't speak protocol-13 control-frame pings.
    /// Tolerant of a bare `"pong"` reply or a `{seq}` echo, per §6.
    async fn send_rpc_ping(self: &Arc<Self>, connections: &Arc<ConnectionRegistry>) -> bool {
        let seq = self.keepalive.next_fallback_seq();
        let timeout = self.keepalive.client_timeout();
        let reply = tokio::time::timeout(timeout, self.call("ping", serde_json::json!({ "seq": seq }))).await;
        match reply {
            Ok(Ok(data)) if keepalive::is_pong_reply(&data) => {
                tracing::trace!(session = %self.id, "pong received over rpc fallback");
                true
            }
            Ok(Ok(other)) => {
                tracing::warn!(session = %self.id, reply = %other, "ping rpc replied with an unrecognized shape, closing session");
                self.close(CloseReason::PingTimeout, connections).await;
                false
            }
            Ok(Err(err)) => {
                tracing::warn!(session = %self.id, %err, "ping rpc failed, closing session");
                self.close(CloseReason::PingTimeout, connections).await;
                false
            }
            Err(_elapsed) => {
                tracing::warn!(session = %self.id, "ping rpc timed out, closing session");
                self.close(CloseReason::PingTimeout, connections).await;
                false
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, text: String) {
        let serial_hint = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("serial").and_then(Value::as_i64));

        match codec::decode(&text, self.config.max_frame_bytes) {
            Ok(frame) => self.dispatch(frame).await,
            Err(err) => {
                tracing::warn!(session = %self.id, %err, "malformed inbound frame");
                let serial = serial_hint.unwrap_or(-1);
                let _ = self
                    .send_frame(&Frame::Error {
                        serial,
                        data: error_payload(&err),
                    })
                    .await;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Call {
                serial,
                call,
                arguments,
            } => {
                let _guard = self.call_table.inbound_guard(serial).await;
                let result = self.invoke(&call, arguments).await;
                let response = match result {
                    Ok(data) => Frame::Callback { serial, data },
                    Err(err) => {
                        tracing::debug!(session = %self.id, %call, %err, "handler returned an error");
                        Frame::Error {
                            serial,
                            data: error_payload(&err),
                        }
                    }
                };
                let _ = self.send_frame(&response).await;
            }
            Frame::Callback { serial, data } => {
                let _guard = self.call_table.inbound_guard(serial).await;
                self.call_table.complete(serial, data);
            }
            Frame::Error { serial, data } => {
                let _guard = self.call_table.inbound_guard(serial).await;
                tracing::warn!(session = %self.id, serial, "peer returned an error");
                self.call_table.reject(serial, data);
            }
        }
    }

    async fn invoke(self: &Arc<Self>, call_name: &str, arguments: Value) -> RpcResult<Value> {
        let args = codec::prepare_args(arguments);
        let handle = self.handle();
        match self.registry.resolve(call_name, &self.route_instances, handle.clone()) {
            Ok(Resolved::Method(instance, method)) => {
                self.executor
                    .run(async move { instance.dispatch(&method, args).await })
                    .await
            }
            Ok(Resolved::Function(func)) => self.executor.run(func(handle, args)).await,
            Err(err) => Err(err),
        }
    }

    /// Encode and send a frame, compressing it first if this session has
    /// compression enabled.
    async fn send_frame(&self, frame: &Frame) -> RpcResult<()> {
        let text = codec::encode(frame)?;
        if self.config.compression {
            let compressed = codec::deflate(text.as_bytes())?;
            self.sink.send_binary(compressed).await
        } else {
            self.sink.send_text(text).await
        }
    }

    /// Make an outbound call to the peer and await its `callback`/`error`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] if the session closes (or the
    /// send itself fails) before a response arrives, or the peer's own
    /// [`RpcError::HandlerError`] if it replies with an `error` frame.
    pub async fn call(self: &Arc<Self>, name: impl Into<String>, args: Value) -> RpcResult<Value> {
        let (serial, rx) = self.call_table.register();
        let frame = Frame::Call {
            serial,
            call: name.into(),
            arguments: args,
        };
        self.send_frame(&frame).await?;
        rx.await
            .map_err(|_| RpcError::ConnectionClosed("session closed before response arrived".into()))?
    }

    /// Explicitly close the session: cancel every pending call, notify every
    /// route instance exactly once, and deregister from `connections`.
    pub async fn close(self: &Arc<Self>, reason: CloseReason, connections: &Arc<ConnectionRegistry>) {
        let mut state = self.state.lock().await;
        if *state != SessionState::Open {
            return;
        }
        *state = SessionState::Closing;
        drop(state);

        tracing::info!(session = %self.id, reason = reason.as_str(), "session closing");
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_one();
        self.call_table.cancel_all(reason.as_str());
        self.sink.close().await;

        for instance in self.route_instances.iter_instances() {
            instance.on_close().await;
        }

        connections.remove(&self.id);
        *self.state.lock().await = SessionState::Closed;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

fn error_payload(err: &RpcError) -> Value {
    serde_json::json!({
        "type": err.wire_kind(),
        "message": err.wire_message(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub struct RecordingSink {
        pub sent: Mutex<Vec<String>>,
    }

    impl Default for RecordingSink {
        fn default() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&self, text: String) -> RpcResult<()> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }
        async fn send_binary(&self, _data: Vec<u8>) -> RpcResult<()> {
            Ok(())
        }
        async fn send_ping(&self, _payload: [u8; 8]) -> RpcResult<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    /// A session with no usable sink, for exercising [`crate::route`] in
    /// isolation; any call made on its handle fails fast rather than hanging.
    pub fn detached_handle() -> SessionHandle {
        let session = Session::new(
            true,
            SessionConfig::default(),
            Arc::new(RouteRegistry::new()),
            Arc::new(RecordingSink::default()),
        );
        session.handle()
    }
}

#[cfg(test)]
impl Session {
    /// Build a [`SessionHandle`] detached from any running dispatch loop,
    /// for tests that only need something to hand to a route factory.
    pub fn new_detached_handle_for_test() -> SessionHandle {
        test_support::detached_handle()
    }
}
