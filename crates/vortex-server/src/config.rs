//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (VORTEX_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::structure::ChannelOptions;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the config file this configuration was loaded from, if any.
    /// Used by structure reloads.
    #[serde(skip)]
    pub path: Option<PathBuf>,

    /// Engine selection.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Node identity and heartbeat settings.
    #[serde(default)]
    pub node: NodeConfig,

    /// Presence refresh settings.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Expired-connection sweep settings.
    #[serde(default)]
    pub sweep: SweepConfig,

    /// External HTTP collaborators.
    #[serde(default)]
    pub web: WebConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Projects served by this node.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// Engine selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine name: `memory` (single-node).
    #[serde(default = "default_engine")]
    pub name: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum requests per inbound frame.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Maximum channel name length.
    #[serde(default = "default_max_channel_length")]
    pub max_channel_length: usize,
}

/// Node identity and heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name shown in heartbeat messages. Defaults to the hostname.
    #[serde(default = "default_node_name")]
    pub name: String,

    /// Heartbeat interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds a node-info entry survives without a refresh.
    #[serde(default = "default_info_max_delay")]
    pub info_max_delay_secs: u64,
}

/// Presence refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Presence-refresh timer interval in seconds.
    #[serde(default = "default_presence_ping")]
    pub ping_interval_secs: u64,

    /// Presence entry TTL in seconds. Must exceed the ping interval or
    /// entries expire between refreshes.
    #[serde(default = "default_presence_expire")]
    pub expire_secs: u64,
}

/// Expired-connection sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Phase-1 collect interval in seconds.
    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,

    /// Phase-2 verify interval in seconds.
    #[serde(default = "default_verify_interval")]
    pub verify_interval_secs: u64,

    /// Minimum seconds between verify rounds for the same project.
    #[serde(default = "default_min_project_interval")]
    pub min_project_interval_secs: u64,
}

/// External HTTP collaborator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebConfig {
    /// Private-channel authorization endpoint. Absent means every private
    /// channel subscribe is denied.
    #[serde(default)]
    pub auth_endpoint: Option<String>,

    /// User liveness-check endpoint. Absent means expiry verification is
    /// deferred until one is configured.
    #[serde(default)]
    pub liveness_endpoint: Option<String>,

    /// Optional webhook receiving every published message.
    #[serde(default)]
    pub publish_hook_endpoint: Option<String>,

    /// Per-attempt HTTP timeout in milliseconds.
    #[serde(default = "default_web_timeout")]
    pub timeout_ms: u64,

    /// Maximum authorization attempts per subscribe.
    #[serde(default = "default_auth_attempts")]
    pub max_auth_attempts: u32,

    /// Back-off delay cap in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
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

/// A project served by this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project id, referenced by connect tokens.
    pub id: String,

    /// Shared HMAC secret.
    pub secret: String,

    /// Seconds a connection's credentials stay valid. Zero disables
    /// connection expiry checking for the project.
    #[serde(default)]
    pub connection_lifetime: u64,

    /// Default channel options for channels without a namespace.
    #[serde(default)]
    pub options: ChannelOptions,

    /// Namespaces with their own option bundles.
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
}

/// A namespace definition inside a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace name, matched against the channel prefix before `:`.
    pub name: String,

    /// Channel options for channels in this namespace.
    #[serde(flatten)]
    pub options: ChannelOptions,
}

// Default value functions
fn default_host() -> String {
    std::env::var("VORTEX_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("VORTEX_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_engine() -> String {
    "memory".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_batch() -> usize {
    100
}

fn default_max_channel_length() -> usize {
    255
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "vortex".to_string())
}

fn default_ping_interval() -> u64 {
    25
}

fn default_info_max_delay() -> u64 {
    60
}

fn default_presence_ping() -> u64 {
    25
}

fn default_presence_expire() -> u64 {
    60
}

fn default_collect_interval() -> u64 {
    3
}

fn default_verify_interval() -> u64 {
    10
}

fn default_min_project_interval() -> u64 {
    10
}

fn default_web_timeout() -> u64 {
    5_000
}

fn default_auth_attempts() -> u32 {
    3
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: None,
            engine: EngineConfig::default(),
            limits: LimitsConfig::default(),
            node: NodeConfig::default(),
            presence: PresenceConfig::default(),
            sweep: SweepConfig::default(),
            web: WebConfig::default(),
            metrics: MetricsConfig::default(),
            projects: Vec::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            max_channel_length: default_max_channel_length(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            ping_interval_secs: default_ping_interval(),
            info_max_delay_secs: default_info_max_delay(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_presence_ping(),
            expire_secs: default_presence_expire(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            collect_interval_secs: default_collect_interval(),
            verify_interval_secs: default_verify_interval(),
            min_project_interval_secs: default_min_project_interval(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "vortex.toml",
            "/etc/vortex/vortex.toml",
            "~/.config/vortex/vortex.toml",
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

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.path = Some(path.to_path_buf());

        Ok(config)
    }

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.engine.name, "memory");
        assert_eq!(config.limits.max_batch, 100);
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr();
        assert_eq!(addr.port(), 8000);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_batch = 50

            [[projects]]
            id = "development"
            secret = "secret"
            connection_lifetime = 3600

            [[projects.namespaces]]
            name = "news"
            publish = true
            history_size = 10
            history_lifetime = 300
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_batch, 50);
        assert_eq!(config.projects.len(), 1);

        let project = &config.projects[0];
        assert_eq!(project.id, "development");
        assert_eq!(project.connection_lifetime, 3600);
        assert_eq!(project.namespaces.len(), 1);
        assert!(project.namespaces[0].options.publish);
        assert_eq!(project.namespaces[0].options.history_size, 10);
        // Unset flags keep their defaults.
        assert!(!project.namespaces[0].options.is_private);
    }
}
