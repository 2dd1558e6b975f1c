//! # imgate-server
//!
//! Long-connection WebSocket gateway for IM clients.
//!
//! Clients connect over an HTTP-upgraded WebSocket, authenticate with a
//! bearer token in an `AUTH` envelope, then exchange `DATA` and `HEARTBEAT`
//! envelopes. The gateway tracks which identities are connected locally and
//! publishes a location record for each one to a shared store, so other
//! gateway processes can route to them.
//!
//! ## Architecture
//!
//! ```text
//!   client ──ws──► acceptor ──► connection task ───────────┐
//!                                 │  codec / state machine  │
//!                                 │  liveness timers        │
//!                                 ▼                         ▼
//!                          TokenVerifier            SessionDirectory ──► DirectoryStore
//!                                                           ▲            (location records)
//!   upstream ◄── UpstreamDispatcher (DATA)                  │
//!   upstream ──► GatewayHandle::push ───────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use imgate_auth::{JwtConfig, JwtVerifier};
//! use imgate_server::{GatewayConfig, GatewayServer, LoggingDispatcher, MemoryDirectoryStore};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::default().with_port(9090);
//! let verifier = JwtVerifier::new(JwtConfig::new_hs256("0123456789abcdef0123456789abcdef")?);
//! let server = GatewayServer::new(
//!     config,
//!     Arc::new(verifier),
//!     Arc::new(MemoryDirectoryStore::new()),
//!     Arc::new(LoggingDispatcher),
//! )?;
//! let handle = server.handle();
//! tokio::spawn(server.serve());
//! // ... later
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod admin;
pub mod config;
pub mod connection;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod liveness;
pub mod server;
pub mod session;
pub mod state;
pub mod stats;
pub mod store;

pub use config::{
    AdminConfig, AuthConfig, DevicePolicy, GatewayConfig, LivenessConfig, ServerConfig,
    SessionConfig,
};
pub use connection::{Connection, ConnectionHandle, ConnectionId, ConnectionIdAllocator, SendError};
pub use directory::{Admission, DeliveryOutcome, DeliveryReport, DirectorySettings, SessionDirectory};
pub use dispatch::{ChannelDispatcher, DispatchError, InboundMessage, LoggingDispatcher, UpstreamDispatcher};
pub use error::{GatewayError, GatewayResult};
pub use liveness::{LivenessEvent, LivenessMonitor, LivenessSettings};
pub use server::{GatewayHandle, GatewayServer};
pub use session::{SessionContext, run_connection};
pub use state::{AtomicConnectionState, CloseReason, ConnectionState, Transition};
pub use stats::{GatewayStats, StatsSnapshot};
pub use store::{DirectoryStore, MemoryDirectoryStore, StoreError, StoreResult};
