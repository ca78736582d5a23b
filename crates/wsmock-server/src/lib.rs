//! # wsmock-server
//!
//! Ephemeral Axum `WebSocket` server for exercising WebSocket clients in tests.
//!
//! - Port allocation: random candidate in a configured range, bounded retry
//! - Connection registry: live clients keyed by random id
//! - Connection workers: one task per client owning its message histories
//! - Auto-replies: exact and filter rules from `wsmock-core`
//! - Teardown via `CancellationToken` + `TaskTracker`
//!
//! ```ignore
//! let server = MockServer::start().await?;
//! server.reply_with("ping", "pong");
//! // connect a client to server.url() ...
//! server.stop().await;
//! ```

#![deny(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::MockServerConfig;
pub use registry::ClientInfo;
pub use server::MockServer;
pub use wsmock_core::{
    ClientId, MatchKind, Matcher, MessageFrame, MockError, Opcode, Payload, Responder, Result,
};
