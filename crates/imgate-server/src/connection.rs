//! Per-connection data and the handle other components use to reach it.
//!
//! A [`Connection`] is owned by the task driving its socket and is never
//! shared. Everything else (the session directory, push callers, the
//! liveness of other connections) talks to it through a cloneable
//! [`ConnectionHandle`], which can only enqueue envelopes or request a close.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use imgate_proto::{Envelope, EnvelopeCodec, Identity};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::{AtomicConnectionState, CloseReason, ConnectionState, Transition};

/// Unique id of a physical connection within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing connection ids.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    /// Start allocating at 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an envelope could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The encoded envelope exceeds the connection's frame limit.
    #[error("frame of {size} bytes exceeds limit {limit}")]
    TooLarge {
        /// Encoded size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

struct HandleInner {
    id: ConnectionId,
    remote_addr: SocketAddr,
    state: Arc<AtomicConnectionState>,
    tx: mpsc::Sender<Envelope>,
    max_frame_length: usize,
    closer: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

/// Cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Whether the connection accepts outbound envelopes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open() && !self.inner.closer.is_cancelled()
    }

    /// Queue an envelope for the connection's writer without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the connection is going away,
    /// [`SendError::TooLarge`] if the envelope would not fit in one frame and
    /// [`SendError::QueueFull`] if its queue is at capacity.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let size = EnvelopeCodec::encoded_len(&envelope);
        if size > self.inner.max_frame_length {
            return Err(SendError::TooLarge {
                size,
                limit: self.inner.max_frame_length,
            });
        }
        self.inner.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Ask the owning task to close the connection. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.closer.cancel();
    }

    /// Reason recorded by [`ConnectionHandle::close`], if any.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    /// Resolves once a close has been requested, by a handle or by shutdown.
    pub async fn closed(&self) {
        self.inner.closer.cancelled().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

/// Connection data owned by its driving task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    state: Arc<AtomicConnectionState>,
    identity: Option<Identity>,
    device_id: Option<String>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl Connection {
    /// Create a connection in `CONNECTING`, its handle, and the receiving end
    /// of its outbound queue.
    ///
    /// `closer` is usually a child of the server's shutdown token so that a
    /// shutdown closes every connection. Envelopes whose encoding exceeds
    /// `max_frame_length` are refused at [`ConnectionHandle::send`].
    #[must_use]
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound_queue: usize,
        max_frame_length: usize,
        closer: CancellationToken,
    ) -> (Self, ConnectionHandle, mpsc::Receiver<Envelope>) {
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Connecting));
        let (tx, rx) = mpsc::channel(outbound_queue.max(1));
        let handle = ConnectionHandle {
            inner: Arc::new(HandleInner {
                id,
                remote_addr,
                state: Arc::clone(&state),
                tx,
                max_frame_length,
                closer,
                close_reason: Mutex::new(None),
            }),
        };
        let now = Utc::now();
        let conn = Self {
            id,
            remote_addr,
            state,
            identity: None,
            device_id: None,
            connected_at: now,
            last_activity: now,
        };
        (conn, handle, rx)
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Apply a lifecycle transition.
    pub fn transition(&self, transition: Transition) -> Option<ConnectionState> {
        self.state.apply(transition)
    }

    /// Authenticated identity, once known.
    #[must_use]
    pub const fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Device id, once known.
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Record the authenticated identity and device.
    pub fn set_identity(&mut self, identity: Identity, device_id: Option<String>) {
        self.identity = Some(identity);
        self.device_id = device_id;
    }

    /// When the transport was accepted.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Last inbound activity.
    #[must_use]
    pub const fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Update the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_connection(queue: usize) -> (Connection, ConnectionHandle, mpsc::Receiver<Envelope>) {
        Connection::new(
            ConnectionId::new(7),
            "127.0.0.1:40000".parse().unwrap(),
            queue,
            1024,
            CancellationToken::new(),
        )
    }

    // ==================== Allocator Tests ====================

    #[test]
    fn test_allocator_is_monotonic() {
        let ids = ConnectionIdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        assert_eq!(a.as_u64(), 1);
        assert!(b > a);
    }

    // ==================== Connection Tests ====================

    #[test]
    fn test_new_connection_is_connecting() {
        let (conn, handle, _rx) = make_connection(4);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(handle.id(), conn.id());
        assert!(conn.identity().is_none());
        assert!(conn.last_activity() >= conn.connected_at());
    }

    #[test]
    fn test_state_shared_with_handle() {
        let (conn, handle, _rx) = make_connection(4);
        conn.transition(Transition::HandshakeComplete);
        assert_eq!(handle.state(), ConnectionState::AwaitingAuth);
    }

    #[test]
    fn test_set_identity() {
        let (mut conn, _handle, _rx) = make_connection(4);
        conn.set_identity(Identity::new("u1"), Some("ios".to_string()));
        assert_eq!(conn.identity().map(Identity::as_str), Some("u1"));
        assert_eq!(conn.device_id(), Some("ios"));
    }

    // ==================== Handle Send Tests ====================

    #[tokio::test]
    async fn test_send_queues_envelope() {
        let (_conn, handle, mut rx) = make_connection(4);
        handle.send(Envelope::data(Bytes::from_static(b"hi"))).unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(&env.payload()[..], b"hi");
    }

    #[test]
    fn test_send_reports_full_queue() {
        let (_conn, handle, _rx) = make_connection(1);
        handle.send(Envelope::heartbeat(None)).unwrap();
        assert_eq!(
            handle.send(Envelope::heartbeat(None)),
            Err(SendError::QueueFull)
        );
    }

    #[test]
    fn test_send_refused_after_close() {
        let (conn, handle, _rx) = make_connection(4);
        conn.transition(Transition::Close);
        assert_eq!(handle.send(Envelope::heartbeat(None)), Err(SendError::Closed));
    }

    #[test]
    fn test_send_refused_after_close_request() {
        let (_conn, handle, _rx) = make_connection(4);
        handle.close(CloseReason::Evicted);
        assert!(!handle.is_open());
        assert_eq!(handle.send(Envelope::heartbeat(None)), Err(SendError::Closed));
    }

    #[test]
    fn test_send_refuses_oversized_envelope() {
        let (_conn, handle, mut rx) = make_connection(4);
        let envelope = Envelope::data(vec![0u8; 2048]);
        let size = EnvelopeCodec::encoded_len(&envelope);
        assert_eq!(
            handle.send(envelope),
            Err(SendError::TooLarge { size, limit: 1024 })
        );
        assert!(rx.try_recv().is_err());
        assert!(handle.is_open());
    }

    // ==================== Handle Close Tests ====================

    #[tokio::test]
    async fn test_close_first_reason_wins() {
        let (_conn, handle, _rx) = make_connection(4);
        handle.close(CloseReason::Evicted);
        handle.close(CloseReason::ShuttingDown);
        handle.closed().await;
        assert_eq!(handle.close_reason(), Some(CloseReason::Evicted));
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_without_reason() {
        let parent = CancellationToken::new();
        let (_conn, handle, _rx) = Connection::new(
            ConnectionId::new(1),
            "127.0.0.1:1".parse().unwrap(),
            4,
            1024,
            parent.child_token(),
        );
        parent.cancel();
        handle.closed().await;
        assert_eq!(handle.close_reason(), None);
    }

    #[test]
    fn test_handle_equality_by_id() {
        let (_conn, handle, _rx) = make_connection(4);
        let clone = handle.clone();
        assert_eq!(handle, clone);
    }
}
