//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the broker shell.
//! All types derive Serde traits for deserialization from config files.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Port used by the local-only fallback when no listener is configured.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Root configuration for the broker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Account to switch to after all privileged operations completed.
    /// Only honoured when the process starts as root.
    pub user: Option<String>,

    /// Process id file for external supervision.
    pub pid_file: Option<PathBuf>,

    /// Detach from the controlling terminal at startup.
    pub daemon: bool,

    /// Default per-listener connection limit. `None` means unlimited.
    pub max_connections: Option<usize>,

    /// Port bound on loopback when `listeners` is empty.
    pub local_only_port: u16,

    /// Ordered listener definitions.
    pub listeners: Vec<ListenerConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            user: Some("mosquitto".to_string()),
            pid_file: None,
            daemon: false,
            max_connections: None,
            local_only_port: DEFAULT_MQTT_PORT,
            listeners: Vec::new(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Wire protocol spoken on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Mqtt,
    MqttSn,
    Websockets,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Mqtt => write!(f, "mqtt"),
            Protocol::MqttSn => write!(f, "mqtt-sn"),
            Protocol::Websockets => write!(f, "websockets"),
        }
    }
}

/// One configured endpoint.
///
/// Exactly one of `bind_port` and `unix_socket_path` is set; `bind_host` and
/// `bind_interface` only make sense together with a port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub protocol: Protocol,

    /// Host name or address. `None` binds every address family.
    pub bind_host: Option<String>,

    pub bind_port: Option<u16>,

    /// Network interface to restrict the socket to.
    pub bind_interface: Option<String>,

    /// Maximum concurrent clients. Falls back to the global default.
    pub max_connections: Option<usize>,

    /// Websocket path prefix the MQTT sub-protocol is mounted at.
    pub mount_point: Option<String>,

    pub unix_socket_path: Option<PathBuf>,

    /// Optional TLS configuration. Hot-swappable on reload.
    pub tls: Option<TlsConfig>,

    pub max_qos: u8,

    pub max_topic_alias: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Mqtt,
            bind_host: None,
            bind_port: None,
            bind_interface: None,
            max_connections: None,
            mount_point: None,
            unix_socket_path: None,
            tls: None,
            max_qos: 2,
            max_topic_alias: 10,
        }
    }
}

impl ListenerConfig {
    /// Plain TCP listener on `host:port`.
    pub fn tcp(host: Option<&str>, port: u16) -> Self {
        Self {
            bind_host: host.map(str::to_string),
            bind_port: Some(port),
            ..Self::default()
        }
    }

    /// Unix domain socket listener.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            unix_socket_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Stable identity used to diff listener sets across reloads.
    ///
    /// Two configs with the same key compete for the same socket.
    pub fn endpoint_key(&self) -> String {
        if let Some(path) = &self.unix_socket_path {
            return format!("unix:{}", path.display());
        }
        let host = self.bind_host.as_deref().unwrap_or("*");
        let port = self.bind_port.unwrap_or(0);
        match &self.bind_interface {
            Some(iface) => format!("{}://{}:{}%{}", self.protocol, host, port, iface),
            None => format!("{}://{}:{}", self.protocol, host, port),
        }
    }

    /// True when the listener terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Same endpoint and same settings apart from the TLS block.
    pub fn same_apart_from_tls(&self, other: &ListenerConfig) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        // TLS on/off still changes the transport; only the contents are swappable.
        a.tls = a.tls.map(|_| TlsConfig::default());
        b.tls = b.tls.map(|_| TlsConfig::default());
        a == b
    }

    /// Effective client limit, honouring the broker-wide default.
    pub fn connection_limit(&self, global: Option<usize>) -> Option<usize> {
        self.max_connections.or(global)
    }
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// CA bundle (PEM) used to verify client certificates.
    pub ca_file: Option<PathBuf>,

    /// Server certificate chain (PEM).
    pub cert_file: Option<PathBuf>,

    /// Server private key (PEM).
    pub key_file: Option<PathBuf>,

    /// Colon separated cipher suite names (IANA spelling, e.g. `TLS13_AES_256_GCM_SHA384`).
    pub cipher_list: Option<String>,

    /// Lowest accepted protocol version: `tlsv1.2` or `tlsv1.3`.
    pub tls_version_min: Option<String>,

    pub require_client_cert: bool,

    /// Certificate revocation list (PEM) applied to client certificates.
    pub crl_file: Option<PathBuf>,

    pub psk_hint: Option<String>,

    /// Use the client certificate's common name as the username.
    pub use_identity_as_username: bool,

    /// Use the client certificate's full subject as the username.
    pub use_subject_as_username: bool,
}

impl TlsConfig {
    /// Every file this context is built from, in load order.
    pub fn material_paths(&self) -> Vec<&PathBuf> {
        [&self.cert_file, &self.key_file, &self.ca_file, &self.crl_file]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// `text` or `json`.
    pub log_format: String,

    /// Append logs here instead of stderr. Required to keep logs once daemonized.
    pub log_file: Option<PathBuf>,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            log_file: None,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Run loop and shutdown tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long sessions may take to close after a termination request.
    pub drain_timeout_secs: u64,

    /// How often the run loop looks at the process flags.
    pub poll_interval_ms: u64,

    /// Upper bound on TLS and WebSocket handshakes of a new connection.
    pub handshake_timeout_secs: u64,

    /// Reload when the configuration file changes on disk.
    pub watch_config: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            poll_interval_ms: 100,
            handshake_timeout_secs: 10,
            watch_config: false,
        }
    }
}
