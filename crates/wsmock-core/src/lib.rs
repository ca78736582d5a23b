//! # wsmock-core
//!
//! Transport-free building blocks of the wsmock test server:
//!
//! - [`frame`]: opcodes, payload classification and canonical encoding
//! - [`rules`]: exact and filter auto-reply rules
//! - [`ids`]: random client identifiers
//! - [`errors`]: the [`MockError`] taxonomy
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod frame;
pub mod ids;
pub mod logging;
pub mod rules;

pub use errors::{MockError, Result};
pub use frame::{MessageFrame, Opcode, Payload, WireFrame};
pub use ids::ClientId;
pub use rules::{MatchKind, Matcher, ReplyRuleStore, Responder, RuleMatch};
