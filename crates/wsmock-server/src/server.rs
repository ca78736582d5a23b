//! `MockServer`: one isolated, ephemeral WebSocket endpoint.
//!
//! Every instance owns its listener, connection registry, reply rules and
//! shutdown coordinator. Nothing is looked up by a global name; the handle
//! returned by [`MockServer::start`] is threaded through every call.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wsmock_core::{Matcher, MessageFrame, MockError, Opcode, ReplyRuleStore, Responder, Result};

use crate::allocator::bind_listener;
use crate::config::MockServerConfig;
use crate::connection::ConnectionHandle;
use crate::registry::{ClientInfo, ConnectionRegistry};
use crate::session::{SessionContext, run_connection};
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    session: Arc<SessionContext>,
    shutdown: Arc<ShutdownCoordinator>,
    max_message_size: usize,
}

#[derive(Clone, Copy)]
enum HistoryKind {
    Received,
    Sent,
}

/// Handle to a running mock server instance.
pub struct MockServer {
    port: u16,
    url: String,
    config: MockServerConfig,
    registry: Arc<ConnectionRegistry>,
    rules: Arc<ReplyRuleStore>,
    shutdown: Arc<ShutdownCoordinator>,
    server_task: JoinHandle<()>,
}

impl MockServer {
    /// Start an instance with the default configuration.
    pub async fn start() -> Result<Self> {
        Self::start_with(MockServerConfig::default()).await
    }

    /// Start an instance.
    ///
    /// Returns once the listener is bound and accepting connections, or
    /// [`MockError::PortBind`] when no candidate port could be bound.
    pub async fn start_with(config: MockServerConfig) -> Result<Self> {
        let (listener, port) = bind_listener(&config).await?;
        let url = format!("ws://localhost:{port}{}", config.path);

        let registry = Arc::new(ConnectionRegistry::new());
        let rules = Arc::new(ReplyRuleStore::new());
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let session = Arc::new(SessionContext {
            registry: Arc::clone(&registry),
            rules: Arc::clone(&rules),
            cancel: shutdown.token(),
            mailbox_capacity: config.mailbox_capacity,
            port,
        });

        let router = build_router(
            &config.path,
            AppState {
                session,
                shutdown: Arc::clone(&shutdown),
                max_message_size: config.max_message_size,
            },
        );

        let token = shutdown.token();
        let server_task = shutdown.spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(token.clone().cancelled_owned());
            if let Err(error) = serve.await {
                error!(port, %error, "listener failed, instance must be restarted");
                token.cancel();
            }
        });

        info!(port, %url, "mock server started");
        Ok(Self {
            port,
            url,
            config,
            registry,
            rules,
            shutdown,
            server_task,
        })
    }

    /// Tear down the listener and every connection worker.
    ///
    /// Workers are cancelled without a close handshake, including any that
    /// are stuck writing to a peer that stopped reading. Waits up to the
    /// configured shutdown timeout; repeated calls return immediately.
    pub async fn stop(&self) {
        if self.shutdown.is_shutting_down() && self.shutdown.task_count() == 0 {
            return;
        }
        if !self.shutdown.shutdown_and_wait(self.config.shutdown_timeout()).await {
            warn!(
                port = self.port,
                remaining = self.shutdown.task_count(),
                "tasks outlived shutdown timeout, aborting listener"
            );
            self.server_task.abort();
        }
        info!(port = self.port, "mock server stopped");
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `ws://localhost:<port>/ws` URL for clients.
    ///
    /// The listener binds `config.host` (IPv4 loopback by default). Clients
    /// that resolve `localhost` to `::1` first fall back to `127.0.0.1` when
    /// nothing listens on the IPv6 port, but would reach any other process
    /// bound to `[::1]:<port>`; connect to the bound host explicitly if that
    /// matters.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Configuration the instance was started with.
    pub fn config(&self) -> &MockServerConfig {
        &self.config
    }

    /// Whether at least one client is connected.
    pub fn is_connected(&self) -> bool {
        self.num_connections() > 0
    }

    /// Number of registered clients.
    pub fn num_connections(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of registered clients and their liveness.
    pub fn list_clients(&self) -> Vec<ClientInfo> {
        self.registry.list()
    }

    /// Wait until at least `n` clients are connected. `false` on timeout.
    pub async fn wait_for_connections(&self, n: usize, timeout: Duration) -> bool {
        self.registry.wait_for_len(n, timeout).await
    }

    /// Queue a frame for one client, bypassing reply rules.
    ///
    /// Never waits on the worker: a client whose mailbox is backed up (for
    /// example a peer that stopped reading) fails with
    /// [`MockError::MailboxFull`].
    pub fn send_message(
        &self,
        client_id: impl AsRef<str>,
        frame: impl Into<MessageFrame>,
    ) -> Result<()> {
        self.lookup(client_id.as_ref())?.send(frame.into())
    }

    /// Queue any serialisable value as a structured text frame.
    pub fn send_json<T: Serialize + ?Sized>(
        &self,
        client_id: impl AsRef<str>,
        value: &T,
    ) -> Result<()> {
        let handle = self.lookup(client_id.as_ref())?;
        handle.send(MessageFrame::json(Opcode::Text, value)?)
    }

    /// Frames received from one client, or from every client when `None`.
    ///
    /// Per-client order is arrival order; across clients it is unspecified.
    /// A worker that does not answer within the query timeout contributes
    /// nothing.
    pub async fn received_messages(&self, client_id: Option<&str>) -> Result<Vec<MessageFrame>> {
        self.history(client_id, HistoryKind::Received).await
    }

    /// Frames sent to one client, or to every client when `None`.
    pub async fn sent_messages(&self, client_id: Option<&str>) -> Result<Vec<MessageFrame>> {
        self.history(client_id, HistoryKind::Sent).await
    }

    /// Register an auto-reply rule for frames received from now on.
    pub fn reply_with(&self, matcher: impl Into<Matcher>, responder: impl Into<Responder>) {
        self.rules.store_rule(matcher.into(), responder.into());
    }

    /// Remove every reply rule.
    pub fn clear_rules(&self) {
        self.rules.clear();
    }

    /// Close one client's connection from the server side.
    ///
    /// Returns immediately; the client is unregistered once its worker exits.
    pub fn disconnect_client(&self, client_id: impl AsRef<str>) -> Result<()> {
        self.lookup(client_id.as_ref())?.close();
        Ok(())
    }

    fn lookup(&self, client_id: &str) -> Result<Arc<ConnectionHandle>> {
        self.registry
            .lookup(client_id)
            .ok_or_else(|| MockError::client_not_found(client_id))
    }

    async fn history(
        &self,
        client_id: Option<&str>,
        kind: HistoryKind,
    ) -> Result<Vec<MessageFrame>> {
        let timeout = self.config.query_timeout();
        let handles = match client_id {
            Some(id) => vec![self.lookup(id)?],
            None => self.registry.handles(),
        };
        let per_client = join_all(handles.iter().map(move |handle| async move {
            match kind {
                HistoryKind::Received => handle.received(timeout).await,
                HistoryKind::Sent => handle.sent(timeout).await,
            }
        }))
        .await;
        Ok(per_client.into_iter().flatten().collect())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("port", &self.port)
            .field("url", &self.url)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Build the router serving the single upgrade route.
fn build_router(path: &str, state: AppState) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .with_state(state)
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let AppState {
        session,
        shutdown,
        max_message_size,
    } = state;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| shutdown.track(run_connection(socket, session)))
}
