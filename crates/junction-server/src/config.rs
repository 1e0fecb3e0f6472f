//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (JUNCTION_HOST, JUNCTION_PORT)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use junction_core::{Realm, RouterConfig, TicketAuthenticator};
use junction_protocol::codec::MAX_MESSAGE_SIZE;
use junction_transport::RawSocketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Router configuration.
    #[serde(default)]
    pub router: RouterSection,

    /// Realms registered at startup.
    #[serde(default = "default_realms")]
    pub realms: Vec<RealmConfig>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Enable the raw socket listener.
    #[serde(default)]
    pub rawsocket: bool,

    /// Raw socket port.
    #[serde(default = "default_rawsocket_port")]
    pub rawsocket_port: u16,

    /// Maximum message size in bytes, applied to WebSocket and raw socket.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Router timeouts and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Time allowed for the first message, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Time allowed for a challenge response, in milliseconds.
    #[serde(default = "default_authenticate_timeout")]
    pub authenticate_timeout_ms: u64,

    /// Agent string sent in WELCOME.
    #[serde(default)]
    pub agent: Option<String>,
}

/// A realm served by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmConfig {
    /// Realm URI.
    pub uri: String,

    /// Tickets accepted by the `ticket` auth method. Empty means open.
    #[serde(default)]
    pub tickets: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("JUNCTION_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("JUNCTION_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_rawsocket_port() -> u16 {
    8000
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_handshake_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_authenticate_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_realms() -> Vec<RealmConfig> {
    vec![RealmConfig {
        uri: "realm1".to_string(),
        tickets: Vec::new(),
    }]
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            router: RouterSection::default(),
            realms: default_realms(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            rawsocket: false,
            rawsocket_port: default_rawsocket_port(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            authenticate_timeout_ms: default_authenticate_timeout(),
            agent: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl RealmConfig {
    /// Build the realm this entry describes.
    #[must_use]
    pub fn build(&self) -> Realm {
        let realm = Realm::new(self.uri.as_str());
        if self.tickets.is_empty() {
            realm
        } else {
            realm.with_challenge_authenticator("ticket", TicketAuthenticator::new(self.tickets.iter().cloned()))
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "junction.toml",
            "/etc/junction/junction.toml",
            "~/.config/junction/junction.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.port)
    }

    /// Get the raw socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn rawsocket_addr(&self) -> Result<SocketAddr> {
        self.addr_with_port(self.transport.rawsocket_port)
    }

    /// Raw socket listener settings.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn rawsocket_config(&self) -> Result<RawSocketConfig> {
        Ok(RawSocketConfig {
            bind_addr: self.rawsocket_addr()?,
            max_message_size: self.transport.max_message_size,
        })
    }

    fn addr_with_port(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, port))
    }

    /// Router settings derived from the `[router]` section.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        let mut config = RouterConfig {
            handshake_timeout: Duration::from_millis(self.router.handshake_timeout_ms),
            authenticate_timeout: Duration::from_millis(self.router.authenticate_timeout_ms),
            ..RouterConfig::default()
        };
        if let Some(agent) = &self.router.agent {
            config.agent = agent.clone();
        }
        config
    }

    /// Check settings that parse but cannot run.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        if self.transport.max_message_size > MAX_MESSAGE_SIZE {
            bail!(
                "transport.max_message_size {} exceeds the codec limit {}",
                self.transport.max_message_size,
                MAX_MESSAGE_SIZE
            );
        }
        if self.transport.rawsocket && self.transport.rawsocket_port == self.port {
            bail!("transport.rawsocket_port must differ from port {}", self.port);
        }
        for (i, realm) in self.realms.iter().enumerate() {
            if realm.uri.is_empty() {
                bail!("realms[{}] has an empty uri", i);
            }
            if self.realms[..i].iter().any(|other| other.uri == realm.uri) {
                bail!("realm {} is configured twice", realm.uri);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert!(!config.transport.rawsocket);
        assert_eq!(config.realms.len(), 1);
        assert_eq!(config.realms[0].uri, "realm1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "0.0.0.0".to_string();
        config.port = 9000;
        config.transport.rawsocket_port = 9001;

        assert_eq!(config.bind_addr().unwrap().port(), 9000);
        assert_eq!(config.rawsocket_addr().unwrap().port(), 9001);

        config.transport.max_message_size = 4096;
        let rawsocket = config.rawsocket_config().unwrap();
        assert_eq!(rawsocket.bind_addr.port(), 9001);
        assert_eq!(rawsocket.max_message_size, 4096);

        config.host = "not a host".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [transport]
            rawsocket = true
            rawsocket_port = 9001

            [router]
            handshake_timeout_ms = 250
            agent = "edge-router"

            [[realms]]
            uri = "com.example.public"

            [[realms]]
            uri = "com.example.private"
            tickets = ["secret"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.transport.rawsocket);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.realms.len(), 2);
        assert_eq!(config.realms[1].tickets, vec!["secret".to_string()]);
        assert!(config.validate().is_ok());

        let router = config.router_config();
        assert_eq!(router.handshake_timeout, Duration::from_millis(250));
        assert_eq!(router.authenticate_timeout, Duration::from_secs(5));
        assert_eq!(router.agent, "edge-router");
    }

    #[test]
    fn test_realm_build() {
        let open = RealmConfig {
            uri: "com.example.public".to_string(),
            tickets: Vec::new(),
        }
        .build();
        assert_eq!(open.uri().as_str(), "com.example.public");

        let private = RealmConfig {
            uri: "com.example.private".to_string(),
            tickets: vec!["secret".to_string()],
        }
        .build();
        assert_eq!(private.uri().as_str(), "com.example.private");
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.transport.websocket_path = "ws".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.rawsocket = true;
        config.transport.rawsocket_port = config.port;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.realms.push(config.realms[0].clone());
        assert!(config.validate().is_err());
    }
}
