//! axum WebSocket upgrade adapter (`feature = "http"`).
//!
//! Grounded on the reference server's `transport/websocket.rs`: an upgrade
//! handler that splits the socket into a sink and a source, wires them to a
//! new [`Session`], and runs it to completion. The one addition this adapter
//! makes over that reference is the `authorize` hook: called with the
//! upgrade request's headers before the handshake completes, it can reject a
//! connection with `403 Forbidden` before any [`Session`] is ever created.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec;
use crate::config::SessionConfig;
use crate::error::{RpcError, RpcResult};
use crate::registry::ConnectionRegistry;
use crate::route::RouteRegistry;
use crate::session::{FrameSink, FrameSource, InboundFrame, Session};

/// Decides whether an incoming upgrade request may proceed, given its
/// headers. The default hook allows everything.
pub type AuthorizeHook = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

fn allow_all(_headers: &HeaderMap) -> bool {
    true
}

/// Shared state for the upgrade route: where new sessions register their
/// routes and themselves, what configuration they start with, and the
/// authorization hook run before the handshake completes.
#[derive(Clone)]
pub struct HttpAdapterState {
    registry: Arc<RouteRegistry>,
    connections: Arc<ConnectionRegistry>,
    config: SessionConfig,
    authorize: AuthorizeHook,
}

impl HttpAdapterState {
    /// Build adapter state with the default always-allow authorization hook.
    #[must_use]
    pub fn new(
        registry: Arc<RouteRegistry>,
        connections: Arc<ConnectionRegistry>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            connections,
            config,
            authorize: Arc::new(allow_all),
        }
    }

    /// Replace the authorization hook.
    #[must_use]
    pub fn with_authorize(mut self, hook: AuthorizeHook) -> Self {
        self.authorize = hook;
        self
    }
}

impl std::fmt::Debug for HttpAdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdapterState")
            .field("sessions", &self.connections.len())
            .finish()
    }
}

/// Build a router exposing the WebSocket upgrade at `/` and `/ws`.
///
/// Serving the companion browser library's static assets (`wsrpc.js`, `q.js`)
/// is left to the embedder, per the external-collaborator framing: nest
/// whatever static-file service fits the host application onto the returned
/// router.
#[must_use]
pub fn router(state: HttpAdapterState) -> Router {
    Router::new()
        .route("/", get(upgrade_handler))
        .route("/ws", get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<HttpAdapterState>,
) -> Result<impl IntoResponse, StatusCode> {
    if !(state.authorize)(&headers) {
        tracing::warn!("websocket upgrade rejected by authorize hook");
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(ws.on_upgrade(move |socket| run_session(socket, state)))
}

async fn run_session(socket: WebSocket, state: HttpAdapterState) {
    let (sender, receiver) = socket.split();
    let sink = Arc::new(AxumSink {
        sender: AsyncMutex::new(sender),
    });
    let source = AxumSource { receiver };

    let session = Session::new(true, state.config.clone(), Arc::clone(&state.registry), sink);
    session.run(source, &state.connections).await;
}

struct AxumSink {
    sender: AsyncMutex<SplitSink<WebSocket, Message>>,
}

#[async_trait::async_trait]
impl FrameSink for AxumSink {
    async fn send_text(&self, text: String) -> RpcResult<()> {
        self.sender
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| RpcError::Io(err.to_string()))
    }

    async fn send_binary(&self, data: Vec<u8>) -> RpcResult<()> {
        self.sender
            .lock()
            .await
            .send(Message::Binary(data.into()))
            .await
            .map_err(|err| RpcError::Io(err.to_string()))
    }

    async fn send_ping(&self, payload: [u8; 8]) -> RpcResult<()> {
        self.sender
            .lock()
            .await
            .send(Message::Ping(payload.to_vec().into()))
            .await
            .map_err(|err| RpcError::Io(err.to_string()))
    }

    async fn close(&self) {
        let _ = self.sender.lock().await.send(Message::Close(None)).await;
    }
}

struct AxumSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Option<InboundFrame> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(InboundFrame::Text(text.to_string())),
                Some(Ok(Message::Binary(data))) => return Some(InboundFrame::Binary(data.to_vec())),
                Some(Ok(Message::Pong(data))) => match codec::unpack_ping_token(&data) {
                    Ok(millis) => return Some(InboundFrame::Pong(millis.to_be_bytes())),
                    Err(err) => {
                        tracing::warn!(%err, "malformed pong payload");
                        continue;
                    }
                },
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(err)) => {
                    tracing::warn!(%err, "websocket receive error");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_authorize_allows_everything() {
        let headers = HeaderMap::new();
        assert!(allow_all(&headers));
    }
}
