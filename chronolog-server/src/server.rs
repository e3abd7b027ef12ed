//! WebSocket RPC server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── Store "public"
//!             ├── Connection ── Dispatcher ── CollectionRouter ──┼── Store "events.login"
//! Client B ──┘   (auth gate)                   │                └── Store "events.click"
//!                                              │
//!                               lifecycle ticker (sweep + flush)
//! ```
//!
//! Each connection is its own task. The first frame must be an `api-key`
//! envelope carrying the shared secret; anything else, or any later protocol
//! error, gets a close frame and the connection ends. Clients reconnect.
//!
//! Shutdown order: stop accepting, drain connections, stop the ticker, final
//! flush, close stores.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chronolog_store::CollectionRouter;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::verify_secret;
use crate::dispatch::Dispatcher;
use crate::lifecycle;
use crate::protocol::{encode, AckResponse, Envelope, MessageType, ProtocolError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Shared secret expected in the `api-key` handshake
    pub secret_key: String,
    /// Flush period (None = never flush, sweep only)
    pub storage_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1985".to_string(),
            secret_key: String::new(),
            storage_interval: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    /// Connections closed for a failed handshake, bad key or bad request
    pub rejected_connections: u64,
}

/// Lock-free counters behind `ServerStats`.
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    rejected_connections: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
        }
    }
}

/// Shared by every connection task.
struct ConnectionContext {
    dispatcher: Dispatcher,
    secret_key: String,
    stats: Arc<AtomicServerStats>,
}

/// The RPC server.
pub struct Server {
    config: ServerConfig,
    router: Arc<CollectionRouter>,
    stats: Arc<AtomicServerStats>,
}

impl Server {
    pub fn new(config: ServerConfig, router: Arc<CollectionRouter>) -> Self {
        Self {
            config,
            router,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<CollectionRouter> {
        &self.router
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Whether the ticker flushes and shutdown runs a final flush.
    pub fn persists(&self) -> bool {
        self.router.is_persistent() && self.config.storage_interval.is_some()
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind `bind_addr` and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()> + Send,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ticker = lifecycle::spawn(
            self.router.clone(),
            self.config.storage_interval,
            stop_rx.clone(),
        );

        let ctx = Arc::new(ConnectionContext {
            dispatcher: Dispatcher::new(self.router.clone()),
            secret_key: self.config.secret_key.clone(),
            stats: self.stats.clone(),
        });
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    let task = Self::run_connection(stream, addr, ctx.clone(), stop_rx.clone());
                    connections.spawn(task);
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }

        drop(listener);
        // Receivers see the change on their next await; a send error only
        // means every receiver is already gone.
        let _ = stop_tx.send(true);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                log::error!("Connection task failed: {e}");
            }
        }
        if let Err(e) = ticker.await {
            log::error!("Lifecycle worker failed: {e}");
        }

        let router = self.router.clone();
        let persist = self.persists();
        tokio::task::spawn_blocking(move || lifecycle::shutdown(&router, persist)).await?;
        log::info!("Server stopped");
        Ok(())
    }

    async fn run_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<ConnectionContext>,
        stop: watch::Receiver<bool>,
    ) {
        let conn_id = Uuid::new_v4();
        ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = Self::handle_connection(stream, addr, conn_id, &ctx, stop).await {
            log::debug!("Connection {conn_id} from {addr} ended with error: {e}");
        }

        ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} closed");
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        conn_id: Uuid,
        ctx: &Arc<ConnectionContext>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                ctx.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Connection {conn_id} established from {addr}");

        let mut authenticated = false;
        loop {
            let msg = tokio::select! {
                msg = ws_receiver.next() => msg,
                _ = stop.changed() => {
                    ws_sender.send(Message::Close(None)).await?;
                    return Ok(());
                }
            };

            let outcome = match msg {
                Some(Ok(Message::Text(text))) => {
                    ctx.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    // Dispatch may open a collection from disk or remove a
                    // uid's directory, so it runs on the blocking pool.
                    let task_ctx = ctx.clone();
                    let mut authed = authenticated;
                    let (outcome, authed) = tokio::task::spawn_blocking(move || {
                        let outcome = Self::respond(&task_ctx, text.as_str(), &mut authed);
                        (outcome, authed)
                    })
                    .await?;
                    authenticated = authed;
                    outcome
                }
                Some(Ok(Message::Binary(_))) => Err(ProtocolError::UnsupportedFrame),
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                // Pings are answered by tungstenite on the next read
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };

            match outcome {
                Ok(reply) => ws_sender.send(Message::Text(reply.into())).await?,
                Err(e) => {
                    ctx.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    match e {
                        ProtocolError::Unauthorized => {
                            log::warn!("Connection {conn_id}: authentication failed")
                        }
                        _ => log::warn!("Connection {conn_id}: rejected request: {e}"),
                    }
                    ws_sender.send(Message::Close(None)).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Authenticate or dispatch one text frame.
    fn respond(
        ctx: &ConnectionContext,
        text: &str,
        authenticated: &mut bool,
    ) -> Result<String, ProtocolError> {
        let envelope = Envelope::decode(text)?;

        if envelope.msg_type == MessageType::ApiKey {
            if !verify_secret(&ctx.secret_key, &envelope.data) {
                return Err(ProtocolError::Unauthorized);
            }
            *authenticated = true;
            return encode(&AckResponse { id: envelope.id });
        }
        if !*authenticated {
            return Err(ProtocolError::Unauthorized);
        }
        ctx.dispatcher.dispatch(&envelope)
    }
}

/// Only `/` upgrades; every other path gets a 404.
fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == "/" {
        return Ok(response);
    }
    log::debug!("Rejecting upgrade to {}", request.uri().path());
    let mut not_found = ErrorResponse::new(Some("Not found".to_string()));
    *not_found.status_mut() = StatusCode::NOT_FOUND;
    Err(not_found)
}
