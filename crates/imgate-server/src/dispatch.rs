//! Hand-off of inbound DATA envelopes to upstream delivery components.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use imgate_proto::Identity;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::ConnectionId;

/// A DATA envelope received from an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Connection it arrived on.
    pub connection_id: ConnectionId,
    /// Sender identity.
    pub identity: Identity,
    /// Sender device, if known.
    pub device_id: Option<String>,
    /// Correlation id from the envelope.
    pub correlation_id: Option<i64>,
    /// Opaque application payload.
    pub payload: Bytes,
    /// When the gateway decoded it.
    pub received_at: DateTime<Utc>,
}

/// Why an inbound message was not handed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Upstream is not keeping up.
    #[error("upstream queue full")]
    QueueFull,
    /// Upstream has gone away.
    #[error("upstream closed")]
    Closed,
}

/// Non-blocking sink for inbound application messages.
///
/// Called from the connection's own task, so implementations must not block.
pub trait UpstreamDispatcher: Send + Sync + fmt::Debug {
    /// Hand off one message.
    fn dispatch(&self, message: InboundMessage) -> Result<(), DispatchError>;
}

/// Dispatcher backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<InboundMessage>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiver upstream consumes.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl UpstreamDispatcher for ChannelDispatcher {
    fn dispatch(&self, message: InboundMessage) -> Result<(), DispatchError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Dispatcher that only logs; used when no upstream is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatcher;

impl UpstreamDispatcher for LoggingDispatcher {
    fn dispatch(&self, message: InboundMessage) -> Result<(), DispatchError> {
        debug!(
            conn_id = %message.connection_id,
            identity = %message.identity,
            correlation_id = ?message.correlation_id,
            bytes = message.payload.len(),
            "inbound message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> InboundMessage {
        InboundMessage {
            connection_id: ConnectionId::new(1),
            identity: Identity::new("u1"),
            device_id: None,
            correlation_id: Some(3),
            payload: Bytes::from_static(b"hello"),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_dispatcher_delivers() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(4);
        dispatcher.dispatch(message()).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.identity.as_str(), "u1");
        assert_eq!(&got.payload[..], b"hello");
    }

    #[test]
    fn test_channel_dispatcher_full() {
        let (dispatcher, _rx) = ChannelDispatcher::new(1);
        dispatcher.dispatch(message()).unwrap();
        assert_eq!(dispatcher.dispatch(message()), Err(DispatchError::QueueFull));
    }

    #[test]
    fn test_channel_dispatcher_closed() {
        let (dispatcher, rx) = ChannelDispatcher::new(1);
        drop(rx);
        assert_eq!(dispatcher.dispatch(message()), Err(DispatchError::Closed));
    }

    #[test]
    fn test_logging_dispatcher_accepts() {
        assert!(LoggingDispatcher.dispatch(message()).is_ok());
    }
}
