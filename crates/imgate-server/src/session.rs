//! Per-connection event loop.
//!
//! One task drives one upgraded connection from `AWAITING_AUTH` to `CLOSED`.
//! Inbound frames, timer expiry, the result of a pending token verification,
//! queued outbound envelopes and close requests are all multiplexed in a
//! single `select!`, so a connection's events are handled one at a time and
//! in arrival order without any per-connection lock.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use imgate_auth::{AuthError, TokenVerifier, VerifiedToken};
use imgate_proto::{AuthRequest, CodecError, Envelope, EnvelopeCodec, PacketType};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionHandle};
use crate::directory::{Admission, SessionDirectory};
use crate::dispatch::{InboundMessage, UpstreamDispatcher};
use crate::error::GatewayError;
use crate::liveness::{LivenessEvent, LivenessMonitor, LivenessSettings};
use crate::state::{CloseReason, ConnectionState, Transition};
use crate::stats::GatewayStats;

/// Collaborators shared by every connection task.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Envelope codec with the configured frame limit.
    pub codec: EnvelopeCodec,
    /// Timer durations.
    pub liveness: LivenessSettings,
    /// Token verifier.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Session directory.
    pub directory: SessionDirectory,
    /// Upstream sink for DATA envelopes.
    pub dispatcher: Arc<dyn UpstreamDispatcher>,
    /// Process counters.
    pub stats: Arc<GatewayStats>,
    /// Deadline for a single socket write.
    pub write_timeout: Duration,
    /// Deadline for draining and closing a socket.
    pub drain_timeout: Duration,
}

struct AuthGrant {
    verified: VerifiedToken,
    device_id: Option<String>,
    admission: Admission,
    correlation_id: Option<i64>,
}

type AuthOutcome = Result<AuthGrant, AuthError>;

enum Event {
    CloseRequested,
    Timer(LivenessEvent),
    AuthFinished(AuthOutcome),
    Outbound(Option<Envelope>),
    Inbound(Option<Result<WsMessage, WsError>>),
}

/// Drive an upgraded WebSocket until it closes; returns why it closed.
///
/// `conn` must already be in `AWAITING_AUTH`. The session is removed from
/// the directory exactly once on the way out, whatever the close trigger.
pub async fn run_connection<S>(
    ws: S,
    conn: Connection,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Envelope>,
    ctx: Arc<SessionContext>,
) -> CloseReason
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin + Send,
{
    let liveness = LivenessMonitor::new(ctx.liveness);
    let mut driver = Driver {
        ws,
        conn,
        handle,
        rx,
        liveness,
        pending_auth: None,
        ctx,
    };
    let reason = driver.run().await;
    driver.finish(reason).await;
    reason
}

struct Driver<S> {
    ws: S,
    conn: Connection,
    handle: ConnectionHandle,
    rx: mpsc::Receiver<Envelope>,
    liveness: LivenessMonitor,
    pending_auth: Option<BoxFuture<'static, AuthOutcome>>,
    ctx: Arc<SessionContext>,
}

impl<S> Driver<S>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin + Send,
{
    async fn run(&mut self) -> CloseReason {
        debug!(conn_id = %self.conn.id(), peer = %self.conn.remote_addr(), "awaiting auth");
        loop {
            let event = tokio::select! {
                biased;
                () = self.handle.closed() => Event::CloseRequested,
                ev = self.liveness.expired() => Event::Timer(ev),
                outcome = poll_pending(&mut self.pending_auth) => Event::AuthFinished(outcome),
                env = self.rx.recv() => Event::Outbound(env),
                frame = self.ws.next() => Event::Inbound(frame),
            };
            let result = match event {
                Event::CloseRequested => {
                    return self.handle.close_reason().unwrap_or(CloseReason::ShuttingDown);
                }
                Event::Timer(ev) => self.on_timer(ev).await,
                Event::AuthFinished(outcome) => self.on_auth_finished(outcome).await,
                Event::Outbound(Some(env)) => self.write(env).await,
                Event::Outbound(None) => Err(self.reject(&GatewayError::Internal(
                    "outbound queue closed".to_string(),
                ))),
                Event::Inbound(frame) => self.on_inbound(frame).await,
            };
            if let Err(reason) = result {
                return reason;
            }
        }
    }

    async fn on_timer(&mut self, event: LivenessEvent) -> Result<(), CloseReason> {
        match event {
            LivenessEvent::AuthTimeout => Err(self.reject(&GatewayError::AuthTimeout(
                self.ctx.liveness.auth_timeout,
            ))),
            LivenessEvent::ReadIdle => {
                info!(
                    conn_id = %self.conn.id(),
                    identity = ?self.conn.identity(),
                    idle = ?self.ctx.liveness.read_idle,
                    "closing idle connection"
                );
                Err(CloseReason::IdleTimeout)
            }
            LivenessEvent::WriteIdle => {
                if self.conn.state() == ConnectionState::Authenticated {
                    self.write(Envelope::heartbeat(None)).await?;
                }
                Ok(())
            }
        }
    }

    async fn on_inbound(&mut self, frame: Option<Result<WsMessage, WsError>>) -> Result<(), CloseReason> {
        let message = match frame {
            None => return Err(CloseReason::RemoteClosed),
            Some(Ok(message)) => message,
            Some(Err(WsError::Capacity(err))) => {
                warn!(conn_id = %self.conn.id(), error = %err, "frame rejected by transport limit");
                return Err(CloseReason::Framing);
            }
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                return Err(CloseReason::RemoteClosed);
            }
            Some(Err(err)) => {
                debug!(conn_id = %self.conn.id(), error = %err, "transport error");
                return Err(CloseReason::Transport);
            }
        };

        self.ctx.stats.record_frame_in();
        self.liveness.record_inbound();
        self.conn.touch();

        match message {
            WsMessage::Binary(data) => match self.ctx.codec.decode(&data) {
                Ok(envelope) => self.on_envelope(envelope).await,
                Err(err) => Err(self.reject(&GatewayError::from(err))),
            },
            WsMessage::Text(_) => Err(self.reject(&GatewayError::Framing(
                CodecError::InvalidPayload("text frames are not accepted".to_string()),
            ))),
            WsMessage::Close(_) => Err(CloseReason::RemoteClosed),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(()),
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<(), CloseReason> {
        let state = self.conn.state();
        let packet_type = envelope.packet_type();
        let violation = GatewayError::ProtocolViolation { packet_type, state };
        if !state.admits(packet_type) {
            return Err(self.reject(&violation));
        }

        match packet_type {
            PacketType::Auth => {
                if self.pending_auth.is_some() {
                    return Err(self.reject(&violation));
                }
                let request = envelope
                    .auth_request()
                    .map_err(|err| self.reject(&GatewayError::from(err)))?;
                self.start_auth(request, envelope.correlation_id());
                Ok(())
            }
            PacketType::Heartbeat => {
                let now_ms = Utc::now().timestamp_millis();
                self.write(Envelope::heartbeat_ack(now_ms, envelope.correlation_id()))
                    .await
            }
            PacketType::HeartbeatAck => Ok(()),
            PacketType::Data => {
                self.dispatch(envelope);
                Ok(())
            }
            PacketType::AuthAck | PacketType::Error => Err(self.reject(&violation)),
        }
    }

    /// Log a connection-terminating error and map it to its close reason.
    fn reject(&self, err: &GatewayError) -> CloseReason {
        warn!(
            conn_id = %self.conn.id(),
            state = %self.conn.state(),
            error = %err,
            "closing connection"
        );
        err.close_reason().unwrap_or(CloseReason::Internal)
    }

    fn start_auth(&mut self, request: AuthRequest, correlation_id: Option<i64>) {
        let verifier = Arc::clone(&self.ctx.verifier);
        let directory = self.ctx.directory.clone();
        self.pending_auth = Some(Box::pin(async move {
            let verified = verifier.verify(&request.token).await?;
            let device_id = verified.effective_device_id(request.device_id.as_deref());
            let admission = directory
                .admission_check(&verified.identity, device_id.as_deref())
                .await;
            Ok(AuthGrant {
                verified,
                device_id,
                admission,
                correlation_id,
            })
        }));
    }

    async fn on_auth_finished(&mut self, outcome: AuthOutcome) -> Result<(), CloseReason> {
        if self.conn.state() != ConnectionState::AwaitingAuth {
            debug!(conn_id = %self.conn.id(), "verification finished after state change, ignored");
            return Ok(());
        }

        let grant = match outcome {
            Ok(grant) => grant,
            Err(err) => {
                self.ctx.stats.record_auth_failure();
                return Err(self.reject(&GatewayError::Auth(err)));
            }
        };

        let identity = grant.verified.identity.clone();
        match grant.admission {
            Admission::Allowed => {}
            Admission::Banned => {
                self.ctx.stats.record_auth_failure();
                warn!(conn_id = %self.conn.id(), identity = %identity, "banned identity refused");
                return Err(CloseReason::Banned);
            }
            Admission::Kicked => {
                self.ctx.stats.record_auth_failure();
                warn!(
                    conn_id = %self.conn.id(),
                    identity = %identity,
                    device_id = ?grant.device_id,
                    "kicked device refused"
                );
                return Err(CloseReason::Kicked);
            }
        }

        if self.conn.transition(Transition::AuthSucceeded).is_none() {
            return Err(CloseReason::Internal);
        }
        self.conn.set_identity(identity.clone(), grant.device_id.clone());
        self.liveness.auth_completed();

        let evicted = self
            .ctx
            .directory
            .register(identity.clone(), self.handle.clone(), grant.device_id.clone())
            .await;
        info!(
            conn_id = %self.conn.id(),
            identity = %identity,
            device_id = ?grant.device_id,
            expires_at = %grant.verified.expires_at,
            evicted,
            "authenticated"
        );

        self.write(Envelope::auth_ack(&identity, grant.correlation_id)).await
    }

    fn dispatch(&self, envelope: Envelope) {
        let Some(identity) = self.conn.identity().cloned() else {
            return;
        };
        let message = InboundMessage {
            connection_id: self.conn.id(),
            identity,
            device_id: self.conn.device_id().map(str::to_string),
            correlation_id: envelope.correlation_id(),
            payload: envelope.payload().clone(),
            received_at: Utc::now(),
        };
        if let Err(err) = self.ctx.dispatcher.dispatch(message) {
            warn!(conn_id = %self.conn.id(), error = %err, "inbound message dropped");
        }
    }

    async fn write(&mut self, envelope: Envelope) -> Result<(), CloseReason> {
        let bytes = match self.ctx.codec.encode(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    conn_id = %self.conn.id(),
                    packet_type = %envelope.packet_type(),
                    error = %err,
                    "outbound envelope dropped"
                );
                return Ok(());
            }
        };
        self.send_frame(bytes).await
    }

    async fn send_frame(&mut self, bytes: Bytes) -> Result<(), CloseReason> {
        let sent = tokio::time::timeout(
            self.ctx.write_timeout,
            self.ws.send(WsMessage::Binary(bytes.to_vec())),
        )
        .await;
        match sent {
            Ok(Ok(())) => {
                self.ctx.stats.record_frame_out();
                self.liveness.record_outbound();
                Ok(())
            }
            Ok(Err(err)) => {
                debug!(conn_id = %self.conn.id(), error = %err, "write failed");
                Err(CloseReason::Transport)
            }
            Err(_) => {
                warn!(conn_id = %self.conn.id(), "write timed out");
                Err(CloseReason::Transport)
            }
        }
    }

    async fn finish(&mut self, reason: CloseReason) {
        self.conn.transition(Transition::Close);
        self.handle.close(reason);
        self.pending_auth = None;

        let identity = self.ctx.directory.unregister(self.conn.id()).await;

        let drain_timeout = self.ctx.drain_timeout;
        if tokio::time::timeout(drain_timeout, self.drain_and_close(reason))
            .await
            .is_err()
        {
            debug!(conn_id = %self.conn.id(), "drain deadline reached");
        }

        self.conn.transition(Transition::Released);
        self.ctx.stats.record_closed();
        info!(
            conn_id = %self.conn.id(),
            peer = %self.conn.remote_addr(),
            identity = ?identity,
            reason = %reason,
            "connection closed"
        );
    }

    async fn drain_and_close(&mut self, reason: CloseReason) {
        self.rx.close();
        if matches!(reason, CloseReason::RemoteClosed | CloseReason::Transport) {
            return;
        }

        while let Some(envelope) = self.rx.recv().await {
            if self.write(envelope).await.is_err() {
                return;
            }
        }
        if let Some(code) = reason.error_code() {
            if self.write(Envelope::error(code, reason.as_str())).await.is_err() {
                return;
            }
        }

        let frame = CloseFrame {
            code: close_code(reason),
            reason: reason.as_str().into(),
        };
        if self.ws.send(WsMessage::Close(Some(frame))).await.is_err() {
            return;
        }
        // Wait for the peer's close reply so the ERROR envelope is not lost to a reset.
        while let Some(Ok(message)) = self.ws.next().await {
            if message.is_close() {
                break;
            }
        }
    }
}

async fn poll_pending(pending: &mut Option<BoxFuture<'static, AuthOutcome>>) -> AuthOutcome {
    let outcome = match pending.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    };
    *pending = None;
    outcome
}

fn close_code(reason: CloseReason) -> CloseCode {
    match reason {
        CloseReason::Framing | CloseReason::ProtocolViolation => CloseCode::Protocol,
        CloseReason::AuthFailed
        | CloseReason::AuthTimeout
        | CloseReason::Banned
        | CloseReason::Kicked
        | CloseReason::Evicted
        | CloseReason::IdleTimeout => CloseCode::Policy,
        CloseReason::ShuttingDown => CloseCode::Away,
        CloseReason::Internal => CloseCode::Error,
        CloseReason::Transport | CloseReason::RemoteClosed => CloseCode::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicePolicy;
    use crate::connection::{ConnectionId, Connection};
    use crate::directory::DirectorySettings;
    use crate::dispatch::ChannelDispatcher;
    use crate::store::{DirectoryStore, MemoryDirectoryStore};
    use imgate_proto::{ErrorCode, Identity};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_util::sync::CancellationToken;

    type Client = WebSocketStream<DuplexStream>;

    struct Harness {
        client: Client,
        handle: ConnectionHandle,
        task: JoinHandle<CloseReason>,
        directory: SessionDirectory,
        store: Arc<MemoryDirectoryStore>,
        inbound: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
        codec: EnvelopeCodec,
    }

    fn verifier() -> Arc<dyn TokenVerifier> {
        let later = Utc::now() + chrono::Duration::hours(1);
        let earlier = Utc::now() - chrono::Duration::hours(1);
        Arc::new(
            imgate_auth::StaticVerifier::new()
                .with_token("good", VerifiedToken::new("u1", later))
                .with_token("good-ios", VerifiedToken::new("u1", later).with_device_id("ios"))
                .with_token("expired", VerifiedToken::new("u1", earlier)),
        )
    }

    /// Verifier that parks every call until released.
    #[derive(Debug, Default)]
    struct GatedVerifier {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl TokenVerifier for GatedVerifier {
        async fn verify(&self, _token: &str) -> imgate_auth::AuthResult<VerifiedToken> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(VerifiedToken::new("u1", Utc::now() + chrono::Duration::hours(1)))
        }
    }

    async fn start(write_idle: Option<Duration>) -> Harness {
        start_with(write_idle, verifier()).await
    }

    async fn start_with(write_idle: Option<Duration>, verifier: Arc<dyn TokenVerifier>) -> Harness {
        let store = Arc::new(MemoryDirectoryStore::new());
        let directory = SessionDirectory::new(
            Arc::clone(&store) as Arc<dyn DirectoryStore>,
            DirectorySettings {
                policy: DevicePolicy::SingleActive,
                node_locator: "node-a".to_string(),
                key_prefix: "im:location:".to_string(),
                location_ttl: Duration::from_secs(7200),
                refresh_interval: Duration::from_secs(1800),
                store_timeout: Duration::from_millis(500),
                retry_attempts: 1,
                retry_base: Duration::from_millis(200),
            },
        );
        let (dispatcher, inbound) = ChannelDispatcher::new(16);
        let codec = EnvelopeCodec::new(1024);
        let ctx = Arc::new(SessionContext {
            codec,
            liveness: LivenessSettings {
                auth_timeout: Duration::from_secs(10),
                read_idle: Duration::from_secs(180),
                write_idle,
            },
            verifier,
            directory: directory.clone(),
            dispatcher: Arc::new(dispatcher),
            stats: Arc::new(GatewayStats::new()),
            write_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(5),
        });

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let shutdown = CancellationToken::new();
        let (conn, handle, rx) = Connection::new(
            ConnectionId::new(1),
            "127.0.0.1:40000".parse().unwrap(),
            16,
            1024,
            shutdown.child_token(),
        );
        conn.transition(Transition::HandshakeComplete);
        let task = tokio::spawn(run_connection(server_ws, conn, handle.clone(), rx, ctx));

        Harness {
            client,
            handle,
            task,
            directory,
            store,
            inbound,
            shutdown,
            codec,
        }
    }

    impl Harness {
        async fn send(&mut self, envelope: &Envelope) {
            let bytes = self.codec.encode(envelope).unwrap();
            self.client.send(WsMessage::Binary(bytes.to_vec())).await.unwrap();
        }

        async fn send_raw(&mut self, raw: Vec<u8>) {
            self.client.send(WsMessage::Binary(raw)).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            loop {
                match self.client.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return self.codec.decode(&data).unwrap(),
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                    other => panic!("expected binary frame, got {other:?}"),
                }
            }
        }

        async fn authenticate(&mut self, token: &str) -> Envelope {
            self.send(&Envelope::auth(&AuthRequest::new(token)).with_correlation_id(7))
                .await;
            self.recv().await
        }

        /// Read the ERROR envelope, then the close frame, then wait for the task.
        async fn expect_closed_with(mut self, code: ErrorCode) -> (CloseReason, Self) {
            let error = self.recv().await;
            assert_eq!(error.packet_type(), PacketType::Error);
            assert_eq!(error.error_payload().unwrap().code, code);
            while let Some(Ok(message)) = self.client.next().await {
                if message.is_close() {
                    break;
                }
            }
            let _ = self.client.close(None).await;
            let reason = (&mut self.task).await.unwrap();
            (reason, self)
        }
    }

    // ==================== Auth Tests ====================

    #[tokio::test]
    async fn test_auth_success_registers_and_acks() {
        let mut h = start(None).await;
        let ack = h.authenticate("good").await;

        assert_eq!(ack.packet_type(), PacketType::AuthAck);
        assert_eq!(ack.correlation_id(), Some(7));
        assert_eq!(&ack.payload()[..], b"u1");
        assert_eq!(h.handle.state(), ConnectionState::Authenticated);
        assert_eq!(h.directory.online_count(), 1);
        assert_eq!(h.directory.identity_of(ConnectionId::new(1)), Some(Identity::new("u1")));
        assert!(h.store.get("im:location:u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_token_closes_without_location() {
        let mut h = start(None).await;
        h.send(&Envelope::auth(&AuthRequest::new("expired"))).await;
        let (reason, h) = h.expect_closed_with(ErrorCode::AuthFailed).await;

        assert_eq!(reason, CloseReason::AuthFailed);
        assert_eq!(h.directory.online_count(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_banned_identity_refused() {
        let mut h = start(None).await;
        h.store.insert("risk:ban:user:u1", "1");
        h.send(&Envelope::auth(&AuthRequest::new("good"))).await;
        let (reason, h) = h.expect_closed_with(ErrorCode::Banned).await;
        assert_eq!(reason, CloseReason::Banned);
        assert_eq!(h.directory.online_count(), 0);
    }

    #[tokio::test]
    async fn test_kicked_device_uses_claim_device() {
        let mut h = start(None).await;
        h.store.insert("auth:kick:u1:ios", "1");
        h.send(&Envelope::auth(
            &AuthRequest::new("good-ios").with_device_id("web"),
        ))
        .await;
        let (reason, _h) = h.expect_closed_with(ErrorCode::Kicked).await;
        assert_eq!(reason, CloseReason::Kicked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_leaves_no_session() {
        let h = start(None).await;
        let (reason, h) = h.expect_closed_with(ErrorCode::AuthTimeout).await;
        assert_eq!(reason, CloseReason::AuthTimeout);
        assert_eq!(h.directory.online_count(), 0);
        assert_eq!(h.directory.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_during_verification_is_noop() {
        let gate = Arc::new(GatedVerifier::default());
        let mut h = start_with(None, Arc::clone(&gate) as Arc<dyn TokenVerifier>).await;
        h.send(&Envelope::auth(&AuthRequest::new("good"))).await;
        gate.entered.notified().await;

        h.shutdown.cancel();
        let (reason, h) = h.expect_closed_with(ErrorCode::ShuttingDown).await;
        gate.release.notify_waiters();
        tokio::task::yield_now().await;

        assert_eq!(reason, CloseReason::ShuttingDown);
        assert_eq!(h.handle.state(), ConnectionState::Closed);
        assert_eq!(h.directory.online_count(), 0);
        assert_eq!(h.directory.connection_count(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_during_verification_is_noop() {
        let gate = Arc::new(GatedVerifier::default());
        let mut h = start_with(None, Arc::clone(&gate) as Arc<dyn TokenVerifier>).await;
        h.send(&Envelope::auth(&AuthRequest::new("good"))).await;
        gate.entered.notified().await;

        let (reason, h) = h.expect_closed_with(ErrorCode::AuthTimeout).await;
        gate.release.notify_waiters();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(reason, CloseReason::AuthTimeout);
        assert_eq!(h.directory.online_count(), 0);
        assert!(h.store.is_empty());
    }

    // ==================== Protocol Tests ====================

    #[tokio::test]
    async fn test_data_before_auth_is_violation() {
        let mut h = start(None).await;
        h.send(&Envelope::data(&b"early"[..])).await;
        let (reason, mut h) = h.expect_closed_with(ErrorCode::ProtocolViolation).await;
        assert_eq!(reason, CloseReason::ProtocolViolation);
        assert!(h.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_auth_is_violation() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        h.send(&Envelope::auth(&AuthRequest::new("good"))).await;
        let (reason, h) = h.expect_closed_with(ErrorCode::ProtocolViolation).await;
        assert_eq!(reason, CloseReason::ProtocolViolation);
        assert_eq!(h.directory.online_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_framing_error() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        let mut raw = vec![PacketType::Data.as_u8(), 0];
        raw.extend_from_slice(&2000u32.to_be_bytes());
        raw.extend(std::iter::repeat_n(0u8, 2000));
        h.send_raw(raw).await;

        let (reason, mut h) = h.expect_closed_with(ErrorCode::FrameRejected).await;
        assert_eq!(reason, CloseReason::Framing);
        assert!(h.inbound.try_recv().is_err());
        assert_eq!(h.directory.online_count(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_packet_type_is_framing_error() {
        let mut h = start(None).await;
        h.send_raw(vec![42, 0, 0, 0, 0, 0]).await;
        let (reason, _h) = h.expect_closed_with(ErrorCode::FrameRejected).await;
        assert_eq!(reason, CloseReason::Framing);
    }

    #[tokio::test]
    async fn test_text_frame_is_framing_error() {
        let mut h = start(None).await;
        h.client.send(WsMessage::Text("hello".to_string())).await.unwrap();
        let (reason, _h) = h.expect_closed_with(ErrorCode::FrameRejected).await;
        assert_eq!(reason, CloseReason::Framing);
    }

    // ==================== Traffic Tests ====================

    #[tokio::test]
    async fn test_heartbeat_acked_with_correlation() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        h.send(&Envelope::heartbeat(Some(99))).await;
        let ack = h.recv().await;
        assert_eq!(ack.packet_type(), PacketType::HeartbeatAck);
        assert_eq!(ack.correlation_id(), Some(99));
        assert!(ack.server_time_ms().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_data_dispatched_upstream() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        h.send(&Envelope::data(&b"payload"[..]).with_correlation_id(5)).await;

        let message = h.inbound.recv().await.unwrap();
        assert_eq!(message.identity, Identity::new("u1"));
        assert_eq!(message.correlation_id, Some(5));
        assert_eq!(&message.payload[..], b"payload");
    }

    #[tokio::test]
    async fn test_push_reaches_client() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        let outcome = h
            .directory
            .deliver(&Identity::new("u1"), &Envelope::data(&b"push"[..]));
        assert_eq!(outcome, crate::directory::DeliveryOutcome::Delivered(1));
        let env = h.recv().await;
        assert_eq!(&env.payload()[..], b"push");
    }

    // ==================== Liveness Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_removes_session() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        assert_eq!(h.directory.online_count(), 1);

        let (reason, h) = h.expect_closed_with(ErrorCode::IdleTimeout).await;
        assert_eq!(reason, CloseReason::IdleTimeout);
        assert_eq!(h.directory.online_count(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_idle_sends_server_heartbeat() {
        let mut h = start(Some(Duration::from_secs(30))).await;
        h.authenticate("good").await;
        let beat = h.recv().await;
        assert_eq!(beat.packet_type(), PacketType::Heartbeat);
    }

    // ==================== Close Tests ====================

    #[tokio::test]
    async fn test_shutdown_closes_with_reason() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        h.shutdown.cancel();
        let (reason, h) = h.expect_closed_with(ErrorCode::ShuttingDown).await;
        assert_eq!(reason, CloseReason::ShuttingDown);
        assert_eq!(h.handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_remote_close_unregisters() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        h.client.close(None).await.unwrap();
        let reason = (&mut h.task).await.unwrap();
        assert_eq!(reason, CloseReason::RemoteClosed);
        assert_eq!(h.directory.online_count(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_queued_push_drained_before_close() {
        let mut h = start(None).await;
        h.authenticate("good").await;
        h.handle.send(Envelope::data(&b"last"[..])).unwrap();
        h.handle.close(CloseReason::Kicked);

        let mut seen = Vec::new();
        while let Some(Ok(message)) = h.client.next().await {
            if let WsMessage::Binary(data) = message {
                seen.push(h.codec.decode(&data).unwrap().packet_type());
            }
        }
        assert!(seen.ends_with(&[PacketType::Error]));
        assert_eq!(h.task.await.unwrap(), CloseReason::Kicked);
    }
}
