//! Handle to a connected client's worker.
//!
//! The worker task owns the connection's histories. Everything outside the
//! worker talks to it through a [`ConnectionHandle`], which wraps the
//! worker's command mailbox, a liveness flag and the connection's own
//! cancellation token.
//!
//! Nothing here waits on the worker without a bound: sends use `try_send`,
//! queries run under a timeout, and closing only cancels a token.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wsmock_core::{ClientId, MessageFrame, MockError, Result, WireFrame};

/// Requests served by a connection worker.
#[derive(Debug)]
pub enum Command {
    /// Transmit a frame that was already validated and encoded.
    Send {
        /// Frame as recorded in the sent history.
        frame: MessageFrame,
        /// Encoded form handed to the transport.
        wire: WireFrame,
    },
    /// Reply with a snapshot of the received history.
    Received(oneshot::Sender<Vec<MessageFrame>>),
    /// Reply with a snapshot of the sent history.
    Sent(oneshot::Sender<Vec<MessageFrame>>),
}

/// Registry entry for one live client connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Client id.
    pub id: ClientId,
    /// Mailbox of the worker task.
    tx: mpsc::Sender<Command>,
    /// Cancelled to close this connection; a child of the instance token.
    closed: CancellationToken,
    /// Cleared once the worker starts closing.
    alive: AtomicBool,
    /// Explicit sends refused because the mailbox was full.
    dropped_messages: AtomicU64,
    /// When the upgrade completed.
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Create a handle around a worker mailbox and its close token.
    pub fn new(id: ClientId, tx: mpsc::Sender<Command>, closed: CancellationToken) -> Self {
        Self {
            id,
            tx,
            closed,
            alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    /// Whether the worker is still open and accepting commands.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.tx.is_closed() && !self.closed.is_cancelled()
    }

    /// Mark the connection as closing.
    pub fn mark_closing(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Token the worker watches for close requests and instance teardown.
    pub fn close_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Queue an explicit send, bypassing reply rules.
    ///
    /// The frame is validated here so payload errors surface to the caller
    /// rather than inside the worker. Never waits: a full mailbox fails with
    /// [`MockError::MailboxFull`] and counts as a dropped message.
    pub fn send(&self, frame: MessageFrame) -> Result<()> {
        let wire = frame.encode()?;
        match self.tx.try_send(Command::Send { frame, wire }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_messages.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(client_id = %self.id, dropped, "mailbox full, frame dropped");
                Err(MockError::MailboxFull {
                    client_id: self.id.to_string(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(MockError::client_not_found(self.id.as_str())),
        }
    }

    /// Total explicit sends dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Ask the worker to close the connection.
    ///
    /// Returns immediately; the worker sends a close frame and unregisters.
    pub fn close(&self) {
        self.mark_closing();
        self.closed.cancel();
    }

    /// Received history, or empty if the worker does not answer in time.
    pub async fn received(&self, timeout: Duration) -> Vec<MessageFrame> {
        self.query(Command::Received, timeout).await
    }

    /// Sent history, or empty if the worker does not answer in time.
    pub async fn sent(&self, timeout: Duration) -> Vec<MessageFrame> {
        self.query(Command::Sent, timeout).await
    }

    async fn query(
        &self,
        make: fn(oneshot::Sender<Vec<MessageFrame>>) -> Command,
        timeout: Duration,
    ) -> Vec<MessageFrame> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx.send(make(reply_tx)).await.ok()?;
            reply_rx.await.ok()
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Some(frames)) => frames,
            Ok(None) => {
                debug!(client_id = %self.id, "worker gone before answering query");
                Vec::new()
            }
            Err(_) => {
                debug!(client_id = %self.id, ?timeout, "history query timed out");
                Vec::new()
            }
        }
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
