//! Listener, acceptor loops and per-connection task wiring.
//!
//! `boss_threads` acceptor tasks share one listening socket. Each accepted
//! stream is admitted against the connection limit, upgraded to a WebSocket
//! under a deadline and handed to its own task, which runs it through
//! [`run_connection`] until it closes. Worker parallelism is the runtime's
//! worker pool; a connection's events are never processed concurrently.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use imgate_auth::TokenVerifier;
use imgate_proto::{Envelope, EnvelopeCodec, Identity};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::connection::{Connection, ConnectionIdAllocator};
use crate::directory::{DeliveryOutcome, DeliveryReport, DirectorySettings, SessionDirectory};
use crate::dispatch::UpstreamDispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::liveness::LivenessSettings;
use crate::session::{SessionContext, run_connection};
use crate::state::Transition;
use crate::stats::{GatewayStats, StatsSnapshot};
use crate::store::{DirectoryStore, StoreResult};

/// Pause after a failed `accept`, typically descriptor exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Cloneable control surface for a running gateway.
///
/// Upstream delivery components push through this; the admin endpoints
/// read from it.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    directory: SessionDirectory,
    stats: Arc<GatewayStats>,
    shutdown: CancellationToken,
}

impl GatewayHandle {
    /// Session directory.
    #[must_use]
    pub const fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    /// Deliver to every local connection of `identity`.
    pub fn push(&self, identity: &Identity, envelope: &Envelope) -> DeliveryOutcome {
        self.directory.deliver(identity, envelope)
    }

    /// Deliver to several identities.
    pub fn push_many<'a, I>(&self, identities: I, envelope: &Envelope) -> DeliveryReport
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        self.directory.deliver_many(identities, envelope)
    }

    /// Deliver to every local connection.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.directory.broadcast(envelope)
    }

    /// Identities online on this node.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.directory.online_count()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(
            self.directory.online_count(),
            self.directory.connection_count(),
            self.directory.store_failures(),
        )
    }

    /// Probe the shared directory store.
    ///
    /// # Errors
    ///
    /// Returns the store error if it is unreachable.
    pub async fn ping_directory(&self) -> StoreResult<()> {
        self.directory.ping().await
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on shutdown, for wiring sibling services.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[derive(Debug)]
struct ServerInner {
    config: GatewayConfig,
    ctx: Arc<SessionContext>,
    ids: ConnectionIdAllocator,
    limiter: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// WebSocket gateway server.
#[derive(Debug)]
pub struct GatewayServer {
    inner: Arc<ServerInner>,
}

impl GatewayServer {
    /// Build a server from validated configuration and its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn new(
        config: GatewayConfig,
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn DirectoryStore>,
        dispatcher: Arc<dyn UpstreamDispatcher>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let settings = DirectorySettings::from_config(&config.session, config.node_locator());
        let ctx = Arc::new(SessionContext {
            codec: EnvelopeCodec::new(config.server.max_frame_length),
            liveness: LivenessSettings::from(&config.liveness),
            verifier,
            directory: SessionDirectory::new(store, settings),
            dispatcher,
            stats: Arc::new(GatewayStats::new()),
            write_timeout: config.server.drain_timeout(),
            drain_timeout: config.server.drain_timeout(),
        });

        Ok(Self {
            inner: Arc::new(ServerInner {
                limiter: Arc::new(Semaphore::new(config.server.max_connections)),
                ids: ConnectionIdAllocator::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                ctx,
                config,
            }),
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Control handle; stays valid after `serve` consumes the server.
    #[must_use]
    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            directory: self.inner.ctx.directory.clone(),
            stats: Arc::clone(&self.inner.ctx.stats),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Bind the listening socket with the configured backlog and socket options.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BindFailed`] if the address cannot be resolved
    /// or bound.
    pub async fn bind(&self) -> GatewayResult<TcpListener> {
        let addr = self.inner.config.server.bind_addr();
        let resolved = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| GatewayError::BindFailed(addr.clone(), e))?
            .next()
            .ok_or_else(|| {
                GatewayError::BindFailed(
                    addr.clone(),
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
                )
            })?;
        bind_socket(resolved, self.inner.config.server.backlog)
            .map_err(|e| GatewayError::BindFailed(addr, e))
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn serve(self) -> GatewayResult<()> {
        let listener = self.bind().await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener until shutdown, then drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's address cannot be read.
    pub async fn serve_on(self, listener: TcpListener) -> GatewayResult<()> {
        let inner = self.inner;
        let local = listener
            .local_addr()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        info!(
            addr = %local,
            path = %inner.config.server.path,
            boss_threads = inner.config.server.boss_threads,
            max_connections = inner.config.server.max_connections,
            device_policy = %inner.config.session.device_policy,
            "gateway listening"
        );

        let refresher = inner.ctx.directory.spawn_refresher(inner.shutdown.clone());
        let listener = Arc::new(listener);
        let acceptors: Vec<_> = (0..inner.config.server.boss_threads)
            .map(|index| tokio::spawn(accept_loop(Arc::clone(&inner), Arc::clone(&listener), index)))
            .collect();

        for acceptor in acceptors {
            if let Err(err) = acceptor.await {
                warn!(error = %err, "acceptor task failed");
            }
        }
        drop(listener);

        info!(
            open = inner.tracker.len(),
            "stopped accepting, draining connections"
        );
        inner.tracker.close();
        let grace = inner.config.server.drain_timeout() + Duration::from_secs(1);
        if tokio::time::timeout(grace, inner.tracker.wait()).await.is_err() {
            warn!(remaining = inner.tracker.len(), "drain deadline passed");
        }
        if let Err(err) = refresher.await {
            warn!(error = %err, "location refresher failed");
        }

        info!("gateway stopped");
        Ok(())
    }
}

fn bind_socket(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.set_nodelay(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn accept_loop(inner: Arc<ServerInner>, listener: Arc<TcpListener>, index: usize) {
    debug!(acceptor = index, "acceptor started");
    loop {
        let accepted = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(acceptor = index, error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let Ok(permit) = Arc::clone(&inner.limiter).try_acquire_owned() else {
            inner.ctx.stats.record_rejected();
            warn!(
                peer = %peer,
                max = inner.config.server.max_connections,
                "connection rejected: limit reached"
            );
            drop(stream);
            continue;
        };
        inner.ctx.stats.record_accepted();
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "set_nodelay failed");
        }

        let task_inner = Arc::clone(&inner);
        inner.tracker.spawn(async move {
            let _permit = permit;
            handle_stream(&task_inner, stream, peer).await;
        });
    }
    debug!(acceptor = index, "acceptor stopped");
}

async fn handle_stream(inner: &ServerInner, stream: TcpStream, peer: SocketAddr) {
    let server = &inner.config.server;
    let id = inner.ids.allocate();
    let (conn, handle, rx) = Connection::new(
        id,
        peer,
        server.outbound_queue,
        server.max_frame_length,
        inner.shutdown.child_token(),
    );

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(server.max_frame_length);
    ws_config.max_frame_size = Some(server.max_frame_length);
    let callback = upgrade_guard(server.path.clone(), server.max_handshake_bytes);

    let upgrade = tokio::select! {
        () = handle.closed() => {
            conn.transition(Transition::Close);
            return;
        }
        upgrade = tokio::time::timeout(
            server.handshake_timeout(),
            accept_hdr_async_with_config(stream, callback, Some(ws_config)),
        ) => upgrade,
    };

    let ws = match upgrade {
        Ok(Ok(ws)) => ws,
        Ok(Err(err)) => {
            inner.ctx.stats.record_handshake_failure();
            debug!(conn_id = %id, peer = %peer, error = %err, "websocket handshake failed");
            conn.transition(Transition::Close);
            return;
        }
        Err(_) => {
            inner.ctx.stats.record_handshake_failure();
            debug!(conn_id = %id, peer = %peer, "websocket handshake timed out");
            conn.transition(Transition::Close);
            return;
        }
    };

    conn.transition(Transition::HandshakeComplete);
    debug!(conn_id = %id, peer = %peer, "websocket upgraded");
    run_connection(ws, conn, handle, rx, Arc::clone(&inner.ctx)).await;
}

/// Handshake callback enforcing the upgrade path and request-head size.
fn upgrade_guard(
    path: String,
    max_bytes: usize,
) -> impl FnOnce(&Request, Response) -> Result<Response, ErrorResponse> {
    move |request: &Request, response: Response| {
        if request.uri().path() != path {
            return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
        }
        if request_head_len(request) > max_bytes {
            return Err(reject(
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                "handshake too large",
            ));
        }
        Ok(response)
    }
}

fn request_head_len(request: &Request) -> usize {
    let line = request.method().as_str().len() + request.uri().to_string().len() + 12;
    request.headers().iter().fold(line, |acc, (name, value)| {
        acc + name.as_str().len() + value.len() + 4
    })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LoggingDispatcher;
    use crate::store::MemoryDirectoryStore;
    use imgate_auth::StaticVerifier;

    fn make_server(config: GatewayConfig) -> GatewayResult<GatewayServer> {
        GatewayServer::new(
            config,
            Arc::new(StaticVerifier::new()),
            Arc::new(MemoryDirectoryStore::new()),
            Arc::new(LoggingDispatcher),
        )
    }

    fn local_config() -> GatewayConfig {
        GatewayConfig::default()
            .with_bind_host("127.0.0.1")
            .with_port(0)
            .with_node_locator("gw-test")
            .with_admin_enabled(false)
    }

    // ==================== Construction Tests ====================

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = make_server(local_config().with_max_frame_length(0));
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_handle_starts_empty() {
        let server = make_server(local_config()).unwrap();
        let stats = server.handle().stats();
        assert_eq!(stats.online_identities, 0);
        assert_eq!(stats.accepted_total, 0);
        assert!(!server.handle().is_shutting_down());
    }

    // ==================== Handshake Guard Tests ====================

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_upgrade_guard_accepts_configured_path() {
        let guard = upgrade_guard("/ws".to_string(), 8192);
        assert!(guard(&request("/ws"), Response::default()).is_ok());
    }

    #[test]
    fn test_upgrade_guard_rejects_other_path() {
        let guard = upgrade_guard("/ws".to_string(), 8192);
        let err = guard(&request("/other"), Response::default()).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_upgrade_guard_rejects_oversized_head() {
        let guard = upgrade_guard("/ws".to_string(), 256);
        let big = Request::builder()
            .uri("/ws")
            .header("x-padding", "a".repeat(512))
            .body(())
            .unwrap();
        let err = guard(&big, Response::default()).unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_bind_reports_failure() {
        let server = make_server(local_config().with_bind_host("256.0.0.1")).unwrap();
        assert!(matches!(
            server.bind().await,
            Err(GatewayError::BindFailed(..))
        ));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = make_server(local_config()).unwrap();
        let handle = server.handle();
        let listener = server.bind().await.unwrap();
        let task = tokio::spawn(server.serve_on(listener));

        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
