//! Connection worker: one task per upgraded client.
//!
//! The worker owns the client's received and sent histories and is the only
//! code that touches them. It multiplexes three event sources:
//!
//! 1. the connection's close token, a child of the instance token, fired by
//!    teardown or `disconnect_client`
//! 2. commands from the facade (explicit sends, history queries)
//! 3. inbound frames from the socket, which are recorded and matched
//!    against the reply rules
//!
//! Socket writes are raced against the close token too, so a peer that
//! stops reading cannot pin the worker past teardown.
//!
//! Lifecycle: `Connecting → Open → Closing → Closed`. The registry entry is
//! removed by a drop guard, so a worker that panics still unregisters.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wsmock_core::{ClientId, MatchKind, MessageFrame, ReplyRuleStore, WireFrame};

use crate::connection::{Command, ConnectionHandle};
use crate::metrics::{
    AUTO_REPLIES_TOTAL, FRAMES_RECEIVED_TOTAL, FRAMES_SENT_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::registry::ConnectionRegistry;

/// Lifecycle state of a connection worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade done, not yet registered.
    Connecting,
    /// Registered and processing frames.
    Open,
    /// No further frames are processed.
    Closing,
    /// Unregistered. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open | Self::Closing)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    fn advance(&mut self, next: Self) {
        debug_assert!(self.can_transition_to(next), "{self:?} -> {next:?}");
        debug!(from = ?*self, to = ?next, "connection state");
        *self = next;
    }
}

/// Instance-wide state shared by every connection worker.
pub struct SessionContext {
    /// Live connections of the instance.
    pub registry: Arc<ConnectionRegistry>,
    /// Reply rules of the instance.
    pub rules: Arc<ReplyRuleStore>,
    /// Cancelled when the instance stops.
    pub cancel: CancellationToken,
    /// Capacity of each worker mailbox.
    pub mailbox_capacity: usize,
    /// Listening port, for log context.
    pub port: u16,
}

#[derive(Default)]
struct History {
    received: Vec<MessageFrame>,
    sent: Vec<MessageFrame>,
}

/// Unregisters the client when the worker exits, including by panic.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    handle: Arc<ConnectionHandle>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.handle.mark_closing();
        let _ = self.registry.unregister(self.handle.id.as_str());
    }
}

/// Why the frame loop ended.
#[derive(Debug)]
enum CloseReason {
    Teardown,
    PeerClosed,
    ServerClosed,
    TransportError,
}

type WsSink = SplitSink<WebSocket, Message>;

/// Upper bound on delivering the close frame of a server-side disconnect.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Run the worker for one upgraded connection until it closes.
#[instrument(skip_all, fields(port = ctx.port, client_id = tracing::field::Empty))]
pub async fn run_connection(ws: WebSocket, ctx: Arc<SessionContext>) {
    let mut state = ConnectionState::Connecting;
    if ctx.cancel.is_cancelled() {
        debug!("upgrade arrived after teardown, dropping socket");
        return;
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel(ctx.mailbox_capacity);
    let handle = register_fresh(&ctx.registry, cmd_tx, &ctx.cancel);
    let _ = tracing::Span::current().record("client_id", handle.id.as_str());
    let registration = Registration {
        registry: Arc::clone(&ctx.registry),
        handle: Arc::clone(&handle),
    };
    let closed = handle.close_token().clone();
    state.advance(ConnectionState::Open);

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut history = History::default();

    let reason = loop {
        tokio::select! {
            biased;

            () = closed.cancelled() => break close_reason(&ctx.cancel),

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send { frame, wire }) => {
                    history.sent.push(frame);
                    if let Err(reason) = transmit(&mut ws_tx, wire, &closed, &ctx.cancel).await {
                        break reason;
                    }
                }
                Some(Command::Received(reply)) => {
                    let _ = reply.send(history.received.clone());
                }
                Some(Command::Sent(reply)) => {
                    let _ = reply.send(history.sent.clone());
                }
                None => break CloseReason::ServerClosed,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(msg)) => {
                    let Some(wire) = to_wire(msg) else {
                        break CloseReason::PeerClosed;
                    };
                    let frame = MessageFrame::decode(wire);
                    let Some(reply) = on_inbound(frame, &ctx.rules, &mut history) else {
                        continue;
                    };
                    if let Err(reason) = transmit(&mut ws_tx, reply, &closed, &ctx.cancel).await {
                        break reason;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "socket error");
                    break CloseReason::TransportError;
                }
                None => break CloseReason::PeerClosed,
            },
        }
    };

    state.advance(ConnectionState::Closing);
    handle.mark_closing();
    if matches!(reason, CloseReason::ServerClosed) {
        send_close_frame(&mut ws_tx, &ctx.cancel).await;
    }
    drop(registration);
    drop(history);
    state.advance(ConnectionState::Closed);

    info!(?reason, "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(handle.age().as_secs_f64());
}

/// Register under a fresh id, regenerating on the (unlikely) collision.
fn register_fresh(
    registry: &ConnectionRegistry,
    cmd_tx: mpsc::Sender<Command>,
    instance: &CancellationToken,
) -> Arc<ConnectionHandle> {
    loop {
        let handle = Arc::new(ConnectionHandle::new(
            ClientId::generate(),
            cmd_tx.clone(),
            instance.child_token(),
        ));
        if registry.register(Arc::clone(&handle)) {
            return handle;
        }
        warn!(client_id = %handle.id, "client id collision, regenerating");
    }
}

/// Teardown when the instance token fired, otherwise a server-side close.
fn close_reason(instance: &CancellationToken) -> CloseReason {
    if instance.is_cancelled() {
        CloseReason::Teardown
    } else {
        CloseReason::ServerClosed
    }
}

/// Record an inbound frame and compute the auto-reply, if a rule matches.
///
/// The reply is recorded in the sent history before it is returned.
fn on_inbound(
    frame: MessageFrame,
    rules: &ReplyRuleStore,
    history: &mut History,
) -> Option<WireFrame> {
    counter!(FRAMES_RECEIVED_TOTAL, "opcode" => frame.opcode.as_str()).increment(1);
    debug!(opcode = %frame.opcode, "frame received");

    let matched = rules.resolve(&frame);
    history.received.push(frame);

    let matched = matched?;
    let wire = match matched.reply.encode() {
        Ok(wire) => wire,
        Err(error) => {
            warn!(%error, "auto-reply payload rejected, nothing sent");
            return None;
        }
    };
    let rule = match matched.kind {
        MatchKind::Exact => "exact",
        MatchKind::Filter(_) => "filter",
    };
    debug!(rule, opcode = %matched.reply.opcode, "auto-reply");
    counter!(AUTO_REPLIES_TOTAL, "rule" => rule).increment(1);

    history.sent.push(matched.reply);
    Some(wire)
}

/// Write one frame, giving up as soon as the connection is closed.
///
/// A peer that stops reading fills the socket buffer and stalls the write;
/// racing it against the close token keeps teardown prompt.
async fn transmit(
    ws_tx: &mut WsSink,
    wire: WireFrame,
    closed: &CancellationToken,
    instance: &CancellationToken,
) -> Result<(), CloseReason> {
    let message = to_message(wire);
    let opcode = match &message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    };
    tokio::select! {
        biased;

        () = closed.cancelled() => {
            debug!(opcode, "write abandoned, connection closing");
            Err(close_reason(instance))
        }
        res = ws_tx.send(message) => match res {
            Ok(()) => {
                counter!(FRAMES_SENT_TOTAL, "opcode" => opcode).increment(1);
                Ok(())
            }
            Err(error) => {
                warn!(%error, opcode, "failed to write frame");
                Err(CloseReason::TransportError)
            }
        },
    }
}

/// Best-effort close frame for a server-side disconnect.
async fn send_close_frame(ws_tx: &mut WsSink, instance: &CancellationToken) {
    tokio::select! {
        biased;

        () = instance.cancelled() => {}
        res = tokio::time::timeout(CLOSE_FRAME_TIMEOUT, ws_tx.send(Message::Close(None))) => {
            if !matches!(res, Ok(Ok(()))) {
                debug!("close frame not delivered");
            }
        }
    }
}

/// Convert a transport message; `None` for close frames.
fn to_wire(msg: Message) -> Option<WireFrame> {
    match msg {
        Message::Text(t) => Some(WireFrame::Text(t.as_str().to_owned())),
        Message::Binary(b) => Some(WireFrame::Binary(b.to_vec())),
        Message::Ping(b) => Some(WireFrame::Ping(b.to_vec())),
        Message::Pong(b) => Some(WireFrame::Pong(b.to_vec())),
        Message::Close(_) => None,
    }
}

fn to_message(wire: WireFrame) -> Message {
    match wire {
        WireFrame::Text(s) => Message::Text(s.into()),
        WireFrame::Binary(b) => Message::Binary(b.into()),
        WireFrame::Ping(b) => Message::Ping(b.into()),
        WireFrame::Pong(b) => Message::Pong(b.into()),
    }
}
