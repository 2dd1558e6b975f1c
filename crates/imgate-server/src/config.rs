//! Gateway configuration.
//!
//! Loaded from TOML with one table per concern:
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! port = 9090
//! path = "/ws"
//! max_frame_length = 65536
//!
//! [liveness]
//! read_idle_timeout_secs = 180
//!
//! [session]
//! device_policy = "single-active"
//!
//! [auth]
//! issuer = "im-auth"
//!
//! [admin]
//! port = 9091
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration
//! apart from the JWT secret, which the binary also accepts from the
//! environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::time::Duration;

use imgate_proto::DEFAULT_MAX_FRAME_LENGTH;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Default WebSocket listen port.
pub const DEFAULT_PORT: u16 = 9090;

/// Default admin HTTP port.
pub const DEFAULT_ADMIN_PORT: u16 = 9091;

/// Default upgrade path.
pub const DEFAULT_PATH: &str = "/ws";

/// Default key prefix for location records.
pub const DEFAULT_KEY_PREFIX: &str = "im:location:";

/// How many simultaneous connections one identity may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevicePolicy {
    /// A new registration evicts the identity's previous connection.
    #[default]
    SingleActive,
    /// Connections coexist; delivery fans out to all of them.
    MultiDevice,
}

impl std::fmt::Display for DevicePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleActive => f.write_str("single-active"),
            Self::MultiDevice => f.write_str("multi-device"),
        }
    }
}

/// Listener, threading and transport limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_host: String,
    /// TCP port for WebSocket upgrades.
    pub port: u16,
    /// Only upgrades to this path are accepted.
    pub path: String,
    /// Number of accept loops sharing the listener.
    pub boss_threads: usize,
    /// Runtime worker threads; 0 means twice the available cores.
    pub worker_threads: usize,
    /// Listen backlog.
    pub backlog: u32,
    /// Largest accepted WebSocket message, in bytes.
    pub max_frame_length: usize,
    /// Upper bound on the upgrade request line plus headers, in bytes.
    pub max_handshake_bytes: usize,
    /// Time allowed to complete the upgrade.
    pub handshake_timeout_secs: u64,
    /// Concurrent socket limit.
    pub max_connections: usize,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
    /// Time allowed to flush pending writes when a connection closes.
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            boss_threads: 1,
            worker_threads: 0,
            backlog: 1024,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_handshake_bytes: 8 * 1024,
            handshake_timeout_secs: 10,
            max_connections: 100_000,
            outbound_queue: 256,
            drain_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Worker thread count with the `0 = 2 x cores` rule applied.
    #[must_use]
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .saturating_mul(2)
    }

    /// Handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Drain timeout.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Per-connection timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Close after this long without inbound traffic.
    pub read_idle_timeout_secs: u64,
    /// Send an unsolicited heartbeat after this long without outbound
    /// traffic; 0 disables it.
    pub write_idle_timeout_secs: u64,
    /// Close if no AUTH arrives within this window.
    pub auth_timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            read_idle_timeout_secs: 180,
            write_idle_timeout_secs: 0,
            auth_timeout_secs: 10,
        }
    }
}

impl LivenessConfig {
    /// Read-idle timeout.
    #[must_use]
    pub const fn read_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.read_idle_timeout_secs)
    }

    /// Write-idle timeout, if enabled.
    #[must_use]
    pub const fn write_idle_timeout(&self) -> Option<Duration> {
        if self.write_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.write_idle_timeout_secs))
        }
    }

    /// Auth timeout.
    #[must_use]
    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Session directory and location-record settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device multiplicity rule.
    pub device_policy: DevicePolicy,
    /// TTL of published location records.
    pub location_ttl_secs: u64,
    /// How often locally online identities are re-published.
    pub location_refresh_secs: u64,
    /// Key prefix for location records.
    pub key_prefix: String,
    /// Value written into location records; defaults to this host's
    /// routable address and the listen port.
    pub node_locator: Option<String>,
    /// Deadline for a single directory-store call.
    pub store_timeout_ms: u64,
    /// Total attempts for a location write, including the first.
    pub store_retry_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    pub store_retry_base_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_policy: DevicePolicy::SingleActive,
            location_ttl_secs: 2 * 60 * 60,
            location_refresh_secs: 30 * 60,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            node_locator: None,
            store_timeout_ms: 500,
            store_retry_attempts: 3,
            store_retry_base_ms: 200,
        }
    }
}

/// Token verification settings.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret, at least 32 bytes.
    pub jwt_secret: Option<String>,
    /// Required issuer.
    pub issuer: Option<String>,
    /// Required audience.
    pub audience: Option<String>,
    /// Clock skew tolerated on `exp`/`nbf`.
    pub leeway_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Read-only admin HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Whether to serve the admin endpoints.
    pub enabled: bool,
    /// Interface to bind.
    pub bind_host: String,
    /// Admin HTTP port.
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_ADMIN_PORT,
        }
    }
}

impl AdminConfig {
    /// `host:port` string for the admin listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Listener and transport.
    pub server: ServerConfig,
    /// Timers.
    pub liveness: LivenessConfig,
    /// Session directory.
    pub session: SessionConfig,
    /// Token verification.
    pub auth: AuthConfig,
    /// Admin HTTP.
    pub admin: AdminConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            liveness: LivenessConfig::default(),
            session: SessionConfig::default(),
            auth: AuthConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> GatewayResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> GatewayResult<()> {
        let server = &self.server;
        if !server.path.starts_with('/') {
            return Err(config_err("server.path must start with '/'"));
        }
        if server.boss_threads == 0 {
            return Err(config_err("server.boss_threads must be at least 1"));
        }
        if server.max_frame_length == 0 {
            return Err(config_err("server.max_frame_length must be positive"));
        }
        if server.max_handshake_bytes < 256 {
            return Err(config_err("server.max_handshake_bytes must be at least 256"));
        }
        if server.max_connections == 0 {
            return Err(config_err("server.max_connections must be positive"));
        }
        if server.outbound_queue == 0 {
            return Err(config_err("server.outbound_queue must be positive"));
        }
        if server.backlog == 0 {
            return Err(config_err("server.backlog must be positive"));
        }

        let liveness = &self.liveness;
        if liveness.read_idle_timeout_secs == 0 {
            return Err(config_err("liveness.read_idle_timeout_secs must be positive"));
        }
        if liveness.auth_timeout_secs == 0 {
            return Err(config_err("liveness.auth_timeout_secs must be positive"));
        }

        let session = &self.session;
        if session.location_ttl_secs == 0 {
            return Err(config_err("session.location_ttl_secs must be positive"));
        }
        if session.location_refresh_secs == 0
            || session.location_refresh_secs >= session.location_ttl_secs
        {
            return Err(config_err(
                "session.location_refresh_secs must be positive and below location_ttl_secs",
            ));
        }
        if session.key_prefix.is_empty() {
            return Err(config_err("session.key_prefix cannot be empty"));
        }
        if session.store_timeout_ms == 0 {
            return Err(config_err("session.store_timeout_ms must be positive"));
        }
        if session.store_retry_attempts == 0 {
            return Err(config_err("session.store_retry_attempts must be at least 1"));
        }

        match &session.node_locator {
            Some(locator) if locator.trim().is_empty() => {
                return Err(config_err("session.node_locator cannot be empty"));
            }
            None if server.port == 0 => {
                return Err(config_err(
                    "session.node_locator is required when server.port is 0",
                ));
            }
            _ => {}
        }

        let secret_len = self.auth.jwt_secret.as_ref().map_or(usize::MAX, String::len);
        if secret_len < imgate_auth::jwt::MIN_SECRET_LEN {
            return Err(config_err(&format!(
                "auth.jwt_secret must be at least {} bytes",
                imgate_auth::jwt::MIN_SECRET_LEN
            )));
        }

        if self.admin.enabled && self.admin.port == self.server.port && self.server.port != 0 {
            return Err(config_err("admin.port must differ from server.port"));
        }
        Ok(())
    }

    /// Value written into location records.
    ///
    /// An explicit `session.node_locator` wins. Otherwise the bind host and
    /// port are used, with a wildcard host replaced by the address this
    /// machine routes from, or by its hostname when it has no route.
    #[must_use]
    pub fn node_locator(&self) -> String {
        if let Some(locator) = &self.session.node_locator {
            return locator.clone();
        }
        let port = self.server.port;
        match self.server.bind_host.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => SocketAddr::new(ip, port).to_string(),
            Ok(_) => match routable_local_ip() {
                Some(ip) => SocketAddr::new(ip, port).to_string(),
                None => format!("{}:{port}", local_hostname()),
            },
            Err(_) if self.server.bind_host.is_empty() => {
                format!("{}:{port}", local_hostname())
            }
            Err(_) => format!("{}:{port}", self.server.bind_host),
        }
    }

    /// Set the bind host.
    #[must_use]
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.server.bind_host = host.into();
        self
    }

    /// Set the listen port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Set the maximum frame length.
    #[must_use]
    pub const fn with_max_frame_length(mut self, len: usize) -> Self {
        self.server.max_frame_length = len;
        self
    }

    /// Set the concurrent connection limit.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.server.max_connections = max;
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub const fn with_drain_timeout_secs(mut self, secs: u64) -> Self {
        self.server.drain_timeout_secs = secs;
        self
    }

    /// Set the auth timeout.
    #[must_use]
    pub const fn with_auth_timeout_secs(mut self, secs: u64) -> Self {
        self.liveness.auth_timeout_secs = secs;
        self
    }

    /// Set the read-idle timeout.
    #[must_use]
    pub const fn with_read_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.liveness.read_idle_timeout_secs = secs;
        self
    }

    /// Set the write-idle timeout (0 disables).
    #[must_use]
    pub const fn with_write_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.liveness.write_idle_timeout_secs = secs;
        self
    }

    /// Set the device policy.
    #[must_use]
    pub const fn with_device_policy(mut self, policy: DevicePolicy) -> Self {
        self.session.device_policy = policy;
        self
    }

    /// Set the node locator.
    #[must_use]
    pub fn with_node_locator(mut self, locator: impl Into<String>) -> Self {
        self.session.node_locator = Some(locator.into());
        self
    }

    /// Set the JWT secret.
    #[must_use]
    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.auth.jwt_secret = Some(secret.into());
        self
    }

    /// Enable or disable the admin surface.
    #[must_use]
    pub const fn with_admin_enabled(mut self, enabled: bool) -> Self {
        self.admin.enabled = enabled;
        self
    }
}

/// Source address the kernel picks for outbound traffic.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
fn routable_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

fn local_hostname() -> String {
    hostname::get().map_or_else(
        |_| "localhost".to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

fn config_err(msg: &str) -> GatewayError {
    GatewayError::Config(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // ==================== Default Tests ====================

    #[test]
    fn test_defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.server.boss_threads, 1);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.max_frame_length, 65_536);
        assert_eq!(config.liveness.read_idle_timeout_secs, 180);
        assert_eq!(config.liveness.write_idle_timeout(), None);
        assert_eq!(config.liveness.auth_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.device_policy, DevicePolicy::SingleActive);
        assert_eq!(config.session.location_ttl_secs, 7200);
        assert_eq!(config.session.key_prefix, "im:location:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_worker_threads() {
        let mut server = ServerConfig::default();
        assert!(server.effective_worker_threads() >= 2);
        server.worker_threads = 3;
        assert_eq!(server.effective_worker_threads(), 3);
    }

    #[test]
    fn test_node_locator_defaults_to_bind_addr() {
        let config = GatewayConfig::default().with_bind_host("10.0.0.5").with_port(9100);
        assert_eq!(config.node_locator(), "10.0.0.5:9100");
        let config = config.with_node_locator("gw-7");
        assert_eq!(config.node_locator(), "gw-7");
    }

    #[test]
    fn test_node_locator_brackets_ipv6_host() {
        let config = GatewayConfig::default().with_bind_host("fd00::5").with_port(9100);
        assert_eq!(config.node_locator(), "[fd00::5]:9100");
    }

    #[test_case("0.0.0.0" ; "ipv4 wildcard")]
    #[test_case("::" ; "ipv6 wildcard")]
    #[test_case("" ; "empty host")]
    fn test_node_locator_never_publishes_wildcard(host: &str) {
        let config = GatewayConfig::default().with_bind_host(host).with_port(9100);
        let locator = config.node_locator();
        let (advertised, port) = locator.rsplit_once(':').unwrap();
        assert_eq!(port, "9100");
        let advertised = advertised.trim_start_matches('[').trim_end_matches(']');
        assert!(!advertised.is_empty());
        if let Ok(ip) = advertised.parse::<IpAddr>() {
            assert!(!ip.is_unspecified());
        }
    }

    // ==================== TOML Tests ====================

    #[test]
    fn test_from_toml_empty() {
        let config = GatewayConfig::from_toml("").unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_from_toml_sections() {
        let toml = r#"
            log_level = "debug"

            [server]
            port = 7000
            boss_threads = 2
            max_frame_length = 1024

            [liveness]
            read_idle_timeout_secs = 60
            write_idle_timeout_secs = 20

            [session]
            device_policy = "multi-device"
            node_locator = "gw-1"

            [admin]
            enabled = false
        "#;
        let config = GatewayConfig::from_toml(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.boss_threads, 2);
        assert_eq!(config.server.max_frame_length, 1024);
        assert_eq!(config.server.path, "/ws");
        assert_eq!(
            config.liveness.write_idle_timeout(),
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.session.device_policy, DevicePolicy::MultiDevice);
        assert_eq!(config.node_locator(), "gw-1");
        assert!(!config.admin.enabled);
    }

    #[test]
    fn test_from_toml_invalid_policy() {
        let err = GatewayConfig::from_toml("[session]\ndevice_policy = \"both\"\n").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_from_file_missing() {
        let err = GatewayConfig::from_file("/nonexistent/imgate.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_validate_rejects_zero_frame_length() {
        let config = GatewayConfig::default().with_max_frame_length(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_path() {
        let mut config = GatewayConfig::default();
        config.server.path = "ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_refresh_not_below_ttl() {
        let mut config = GatewayConfig::default();
        config.session.location_refresh_secs = config.session.location_ttl_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let config = GatewayConfig::default().with_jwt_secret("too-short");
        assert!(config.validate().is_err());
        let config = GatewayConfig::default().with_jwt_secret("x".repeat(32));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_store_timeout() {
        let mut config = GatewayConfig::default();
        config.session.store_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_validate_requires_locator_for_ephemeral_port() {
        let config = GatewayConfig::default().with_port(0);
        assert!(config.validate().is_err());
        let config = config.with_node_locator("gw-test");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_locator() {
        let config = GatewayConfig::default().with_node_locator("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut config = GatewayConfig::default();
        config.admin.port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_debug_redacts_secret() {
        let config = GatewayConfig::default().with_jwt_secret("s".repeat(40));
        let debug = format!("{:?}", config.auth);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("ssss"));
    }

    #[test]
    fn test_device_policy_display() {
        assert_eq!(DevicePolicy::SingleActive.to_string(), "single-active");
        assert_eq!(DevicePolicy::MultiDevice.to_string(), "multi-device");
    }
}
