//! # wsrpc-session
//!
//! A bidirectional JSON-RPC engine for a single WebSocket connection: either
//! side may initiate a call, both sides track pending calls and route names
//! through the same machinery, and routes are resolved through one shared,
//! process-wide registry.
//!
//! ## Architecture
//!
//! ```text
//! wsrpc-session/
//! ├── error.rs     # The RpcError taxonomy and its wire representation
//! ├── config.rs    # Process-wide defaults and per-session SessionConfig
//! ├── codec.rs      # Wire frame (de)serialization, compression, ping tokens
//! ├── route.rs     # RouteRegistry, RouteDispatch, bare-function dispatch
//! ├── calltable.rs # Outstanding outbound calls and per-serial inbound locking
//! ├── pool.rs      # The bounded worker pool backing threaded dispatch
//! ├── executor.rs  # Cooperative vs. threaded handler dispatch
//! ├── keepalive.rs # Ping scheduling and pong round-trip tracking
//! ├── session.rs   # The per-connection state machine and dispatch loop
//! ├── registry.rs  # The process-wide table of live sessions, for broadcast
//! └── http.rs      # axum WebSocket upgrade adapter (feature = "http")
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wsrpc_session::route::{RouteDispatch, RouteRegistry};
//! use wsrpc_session::session::Session;
//!
//! let registry = Arc::new(RouteRegistry::new());
//! registry.register_route("chat", Arc::new(|handle| Arc::new(ChatRoute::new(handle)) as _));
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod calltable;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub mod http;
pub mod keepalive;
pub mod pool;
pub mod registry;
pub mod route;
pub mod session;

pub use codec::{CallArgs, Frame};
pub use config::{
    configure, init_pool, ExecutorKind, PingMode, SessionConfig, SessionConfigBuilder,
};
pub use error::{RpcError, RpcResult};
pub use registry::ConnectionRegistry;
pub use route::{BareFn, RouteDispatch, RouteFactory, RouteInstanceCache, RouteRegistry, PING_ROUTE};
pub use session::{CloseReason, FrameSink, FrameSource, InboundFrame, Session, SessionHandle};
