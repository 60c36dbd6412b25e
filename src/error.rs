//! Error types for the RPC session engine.

use thiserror::Error;

/// A specialized `Result` type for session operations.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Errors that can occur while decoding, dispatching, or running an RPC session.
///
/// Variants carrying a `type` string in their `Display` impl are the ones the
/// wire protocol can surface in an `error` frame's `data.type` field; see
/// [`RpcError::wire_kind`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RpcError {
    /// The inbound frame was not valid JSON, or was missing/had a negative `serial`.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The requested route or method does not exist, is private, or is opted out of dispatch.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// `arguments` had a shape the handler could not be called with.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// The handler itself raised or returned an error.
    #[error("handler error ({kind}): {message}")]
    HandlerError {
        /// The handler-reported error class/kind.
        kind: String,
        /// The handler-reported error message.
        message: String,
    },

    /// The session closed before a pending call's response arrived. Local only;
    /// never sent on the wire.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A keepalive ping did not receive a pong within `client_timeout`.
    #[error("ping timeout after {0:?}")]
    PingTimeout(std::time::Duration),

    /// The worker pool has been shut down and cannot accept new work.
    #[error("worker pool is shut down")]
    PoolShutDown,

    /// A spawned task panicked instead of returning.
    #[error("handler task panicked: {0}")]
    TaskPanicked(String),

    /// An I/O error occurred on the underlying transport.
    #[error("transport io error: {0}")]
    Io(String),
}

impl RpcError {
    /// The string the wire protocol uses for this error's `data.type` field.
    ///
    /// [`RpcError::ConnectionClosed`] is deliberately excluded from callers'
    /// view of the wire: it only ever terminates a local [`PendingCall`],
    /// never an inbound frame, so it has no wire representation.
    ///
    /// [`PendingCall`]: crate::calltable::PendingCall
    pub fn wire_kind(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "MalformedFrame",
            Self::MethodNotFound(_) => "MethodNotFound",
            Self::BadArguments(_) => "BadArguments",
            Self::HandlerError { .. } => "HandlerError",
            Self::ConnectionClosed(_) => "ConnectionClosed",
            Self::PingTimeout(_) => "PingTimeout",
            Self::PoolShutDown | Self::TaskPanicked(_) | Self::Io(_) => "HandlerError",
        }
    }

    /// The message half of the `{type, message}` wire payload.
    pub fn wire_message(&self) -> String {
        match self {
            Self::HandlerError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedFrame(err.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for RpcError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            Self::TaskPanicked(err.to_string())
        } else {
            Self::ConnectionClosed(format!("task cancelled: {err}"))
        }
    }
}
