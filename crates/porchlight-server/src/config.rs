//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`--config`, or the first of the default paths)
//! - Environment variables (`PORCHLIGHT_PORT`, `PORCHLIGHT_AUTH__PASSWORD`, ...)

use anyhow::{Context, Result};
use porchlight_protocol::{DEFAULT_ACK_TOPIC, DEFAULT_NOTIFY_TOPIC, DEFAULT_PRESENCE_TOPIC};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, in search order.
const CONFIG_PATHS: [&str; 3] = [
    "porchlight.toml",
    "/etc/porchlight/porchlight.toml",
    "~/.config/porchlight/porchlight.toml",
];

/// Environment variable prefix.
const ENV_PREFIX: &str = "PORCHLIGHT";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host the MQTT listener binds to.
    #[serde(default = "default_host")]
    pub host: String,

    /// MQTT listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client credentials.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Well-known topic names.
    #[serde(default)]
    pub topics: TopicsConfig,

    /// Cooldown behaviour.
    #[serde(default)]
    pub cooldown: CooldownConfig,

    /// Monitored button fleet.
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Health endpoint.
    #[serde(default)]
    pub health: HealthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// The single username/password pair every client must present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,
}

/// Topic names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    /// Presence reports from the capture pipeline.
    #[serde(default = "default_presence_topic")]
    pub presence: String,

    /// Acknowledgments from buttons.
    #[serde(default = "default_ack_topic")]
    pub acknowledgment: String,

    /// Derived notify signal (retained).
    #[serde(default = "default_notify_topic")]
    pub notify: String,
}

/// Cooldown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Suppression window after an acknowledgment, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub duration_secs: u64,

    /// Whether an acknowledgment during a cooldown starts it over.
    #[serde(default = "default_true")]
    pub restart_on_ack: bool,

    /// Where the diagnostic cooldown snapshot is written.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

/// Fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Client ID prefix identifying monitored buttons.
    #[serde(default = "default_client_prefix")]
    pub client_prefix: String,

    /// Minimum number of connected buttons.
    #[serde(default = "default_required")]
    pub required: usize,

    /// How long the fleet may stay below minimum before it is unhealthy, in seconds.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Serve the health endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_health_port")]
    pub port: u16,

    /// Presence reports older than this mark the capture pipeline stale, in seconds.
    #[serde(default = "default_capture_window_secs")]
    pub capture_window_secs: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum packet size in bytes.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// Seconds a client has to send CONNECT.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Seconds before an unacknowledged delivery is resent.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Unacknowledged deliveries allowed per connection.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2000
}

fn default_username() -> String {
    "user".to_string()
}

fn default_password() -> String {
    "pass".to_string()
}

fn default_presence_topic() -> String {
    DEFAULT_PRESENCE_TOPIC.to_string()
}

fn default_ack_topic() -> String {
    DEFAULT_ACK_TOPIC.to_string()
}

fn default_notify_topic() -> String {
    DEFAULT_NOTIFY_TOPIC.to_string()
}

fn default_true() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    120 // 2 minutes
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("cooldown_state.json")
}

fn default_client_prefix() -> String {
    "ESP8266-Button-".to_string()
}

fn default_required() -> usize {
    1
}

fn default_grace_secs() -> u64 {
    120
}

fn default_health_port() -> u16 {
    8080
}

fn default_capture_window_secs() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_topics() -> usize {
    1000
}

fn default_max_subscriptions() -> usize {
    32
}

fn default_max_packet_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_retry_interval_secs() -> u64 {
    10
}

fn default_max_inflight() -> usize {
    64
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            topics: TopicsConfig::default(),
            cooldown: CooldownConfig::default(),
            fleet: FleetConfig::default(),
            health: HealthConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            presence: default_presence_topic(),
            acknowledgment: default_ack_topic(),
            notify: default_notify_topic(),
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_cooldown_secs(),
            restart_on_ack: true,
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            client_prefix: default_client_prefix(),
            required: default_required(),
            grace_secs: default_grace_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_health_port(),
            capture_window_secs: default_capture_window_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_topics: default_max_topics(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_packet_size: default_max_packet_size(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            max_inflight: default_max_inflight(),
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

impl Config {
    /// Load configuration from a file plus environment overrides.
    ///
    /// With no explicit path the default locations are searched; if none
    /// exists, defaults plus environment overrides are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => CONFIG_PATHS
                .iter()
                .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
                .find(|p| p.exists()),
        };

        if let Some(file) = &file {
            tracing::info!("Loading configuration from {}", file.display());
            builder = builder.add_source(config::File::from(file.as_path()).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .with_context(|| match &file {
                Some(file) => format!("Failed to parse config file: {}", file.display()),
                None => "Failed to parse configuration from environment".to_string(),
            })?;

        Ok(config)
    }

    /// Get the MQTT socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get the health endpoint socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn health_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.health.host, self.health.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid health host:port {}:{}",
                    self.health.host, self.health.port
                )
            })
    }

    /// Whether the built-in development credentials are still in use.
    #[must_use]
    pub fn uses_default_credentials(&self) -> bool {
        self.auth.username == default_username() && self.auth.password == default_password()
    }
}

impl CooldownConfig {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

impl FleetConfig {
    #[must_use]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl HealthConfig {
    #[must_use]
    pub fn capture_window(&self) -> Duration {
        Duration::from_secs(self.capture_window_secs)
    }
}

impl LimitsConfig {
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }
}
