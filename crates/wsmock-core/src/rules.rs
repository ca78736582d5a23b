//! Auto-reply rules.
//!
//! Two kinds of rule live in a [`ReplyRuleStore`]:
//!
//! - **exact** rules, keyed by `(opcode, canonical payload)`; registering the
//!   same key twice replaces the earlier responder
//! - **filter** rules, an append-only list of predicates evaluated in
//!   registration order; the first predicate returning `true` wins
//!
//! Exact rules are always consulted first. A matched [`Responder`] produces
//! the outbound frame, either a fixed frame or the result of a transform
//! applied to the inbound frame.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::frame::{MessageFrame, Opcode};

/// Predicate evaluated against a decoded inbound frame.
pub type Predicate = Arc<dyn Fn(&MessageFrame) -> bool + Send + Sync>;

/// Function computing a reply from a decoded inbound frame.
pub type Transform = Arc<dyn Fn(&MessageFrame) -> MessageFrame + Send + Sync>;

/// Selects the inbound frames a rule applies to.
#[derive(Clone)]
pub enum Matcher {
    /// Matches frames whose opcode and canonical payload equal this frame's.
    Exact(MessageFrame),
    /// Matches frames for which the predicate returns `true`.
    Predicate(Predicate),
}

impl Matcher {
    /// Exact matcher. Bare strings and JSON values are text frames.
    pub fn exact(frame: impl Into<MessageFrame>) -> Self {
        Self::Exact(frame.into())
    }

    /// Predicate matcher.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&MessageFrame) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(frame) => f.debug_tuple("Exact").field(frame).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<MessageFrame> for Matcher {
    fn from(frame: MessageFrame) -> Self {
        Self::Exact(frame)
    }
}

impl From<&str> for Matcher {
    fn from(text: &str) -> Self {
        Self::Exact(MessageFrame::text(text))
    }
}

impl From<String> for Matcher {
    fn from(text: String) -> Self {
        Self::Exact(MessageFrame::text(text))
    }
}

impl From<Value> for Matcher {
    fn from(value: Value) -> Self {
        Self::Exact(MessageFrame::structured(value))
    }
}

impl From<(Opcode, &str)> for Matcher {
    fn from(pair: (Opcode, &str)) -> Self {
        Self::Exact(pair.into())
    }
}

/// Produces the reply for a matched frame.
#[derive(Clone)]
pub enum Responder {
    /// Always reply with this frame.
    Static(MessageFrame),
    /// Reply with the transform's result for the inbound frame.
    Transform(Transform),
}

impl Responder {
    /// Static responder. Bare strings and JSON values are text frames.
    pub fn reply(frame: impl Into<MessageFrame>) -> Self {
        Self::Static(frame.into())
    }

    /// Transform responder. The closure may return anything convertible to
    /// a frame, so returning a bare `String` yields a text frame.
    pub fn transform<F, R>(f: F) -> Self
    where
        F: Fn(&MessageFrame) -> R + Send + Sync + 'static,
        R: Into<MessageFrame>,
    {
        Self::Transform(Arc::new(move |frame| f(frame).into()))
    }

    /// Compute the outbound frame for `inbound`.
    pub fn respond(&self, inbound: &MessageFrame) -> MessageFrame {
        match self {
            Self::Static(frame) => frame.clone(),
            Self::Transform(f) => f(inbound),
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(frame) => f.debug_tuple("Static").field(frame).finish(),
            Self::Transform(_) => f.write_str("Transform(..)"),
        }
    }
}

impl From<MessageFrame> for Responder {
    fn from(frame: MessageFrame) -> Self {
        Self::Static(frame)
    }
}

impl From<&str> for Responder {
    fn from(text: &str) -> Self {
        Self::Static(MessageFrame::text(text))
    }
}

impl From<String> for Responder {
    fn from(text: String) -> Self {
        Self::Static(MessageFrame::text(text))
    }
}

impl From<Value> for Responder {
    fn from(value: Value) -> Self {
        Self::Static(MessageFrame::structured(value))
    }
}

impl From<(Opcode, &str)> for Responder {
    fn from(pair: (Opcode, &str)) -> Self {
        Self::Static(pair.into())
    }
}

/// Which kind of rule produced a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// An exact rule.
    Exact,
    /// The filter rule at this registration index.
    Filter(usize),
}

/// A resolved auto-reply.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleMatch {
    /// Rule that matched.
    pub kind: MatchKind,
    /// Frame to send back.
    pub reply: MessageFrame,
}

struct FilterRule {
    predicate: Predicate,
    responder: Responder,
}

#[derive(Default)]
struct Rules {
    exact: HashMap<(Opcode, Vec<u8>), Responder>,
    filters: Vec<Arc<FilterRule>>,
}

/// Per-instance store of exact and filter reply rules.
#[derive(Default)]
pub struct ReplyRuleStore {
    rules: RwLock<Rules>,
}

impl ReplyRuleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule.
    ///
    /// Exact matchers upsert by `(opcode, canonical payload)`; predicate
    /// matchers are appended after every filter registered so far.
    pub fn store_rule(&self, matcher: Matcher, responder: Responder) {
        let mut rules = self.rules.write();
        match matcher {
            Matcher::Exact(frame) => {
                let key = frame.canonical_key();
                if rules.exact.insert(key, responder).is_some() {
                    debug!(opcode = %frame.opcode, "replaced exact reply rule");
                }
            }
            Matcher::Predicate(predicate) => {
                rules.filters.push(Arc::new(FilterRule {
                    predicate,
                    responder,
                }));
            }
        }
    }

    /// Find the reply for an inbound frame, if any rule matches.
    ///
    /// User callbacks run outside the store lock. A predicate or transform
    /// that panics is logged and treated as not matching.
    pub fn resolve(&self, inbound: &MessageFrame) -> Option<RuleMatch> {
        let (exact, filters) = {
            let rules = self.rules.read();
            let exact = rules.exact.get(&inbound.canonical_key()).cloned();
            let filters = if exact.is_some() {
                Vec::new()
            } else {
                rules.filters.clone()
            };
            (exact, filters)
        };

        if let Some(responder) = exact {
            return respond_guarded(&responder, inbound).map(|reply| RuleMatch {
                kind: MatchKind::Exact,
                reply,
            });
        }

        for (index, rule) in filters.iter().enumerate() {
            let matched = catch_unwind(AssertUnwindSafe(|| (rule.predicate)(inbound)))
                .unwrap_or_else(|_| {
                    warn!(index, "reply predicate panicked, skipping rule");
                    false
                });
            if matched {
                return respond_guarded(&rule.responder, inbound).map(|reply| RuleMatch {
                    kind: MatchKind::Filter(index),
                    reply,
                });
            }
        }
        None
    }

    /// Remove every rule.
    pub fn clear(&self) {
        let mut rules = self.rules.write();
        rules.exact.clear();
        rules.filters.clear();
    }

    /// Number of exact rules.
    pub fn exact_count(&self) -> usize {
        self.rules.read().exact.len()
    }

    /// Number of filter rules.
    pub fn filter_count(&self) -> usize {
        self.rules.read().filters.len()
    }
}

fn respond_guarded(responder: &Responder, inbound: &MessageFrame) -> Option<MessageFrame> {
    if let Ok(reply) = catch_unwind(AssertUnwindSafe(|| responder.respond(inbound))) {
        Some(reply)
    } else {
        warn!("reply transform panicked, no reply sent");
        None
    }
}
