//! Configuration for vhost-rs

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::policy::HostPolicy;

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Primary site name, used to label log output
    #[serde(default = "default_site")]
    pub site: String,
    /// Directory holding issued certificates
    #[serde(default = "default_cache_dir", alias = "CacheDir")]
    pub cache_dir: PathBuf,
    /// Hostnames (or patterns) allowed to receive a certificate
    #[serde(default, alias = "Valid", alias = "AllowedHosts")]
    pub allowed_hosts: Vec<String>,
    /// How `allowed_hosts` is interpreted
    #[serde(default)]
    pub host_policy: HostPolicyMode,
    /// ACME contact address
    #[serde(default, alias = "Email", alias = "ContactEmail")]
    pub contact_email: Option<String>,
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Host routes, in match order
    #[serde(default, alias = "Hosts")]
    pub hosts: Vec<HostRoute>,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// TLS listen address (e.g., "0.0.0.0:443")
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Plaintext listen address for redirects and HTTP-01 challenges
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Deadline for reading request headers
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Deadline for a stalled write to the client
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Idle connections are closed after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Host prefix requests are normalized to; empty disables normalization
    #[serde(default = "default_canonical_prefix")]
    pub canonical_prefix: String,
}

/// A single host route
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HostRoute {
    /// Regular expression over "host+path" or "host"
    #[serde(alias = "Route", alias = "Pattern")]
    pub route: String,
    /// Backend URL (e.g., "http://127.0.0.1:9001")
    #[serde(alias = "Target")]
    pub target: String,
}

/// Interpretation of `allowed_hosts`
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostPolicyMode {
    /// Entries are regular expressions joined by alternation
    #[default]
    Pattern,
    /// Entries are exact hostnames
    Exact,
}

fn default_site() -> String {
    "www.example.com".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/vhost-rs/certs")
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_read_timeout() -> u64 {
    5
}

fn default_write_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_canonical_prefix() -> String {
    "www.".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            https_addr: default_https_addr(),
            http_addr: default_http_addr(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            canonical_prefix: default_canonical_prefix(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Port of the TLS listener, used when building redirect URLs
    pub fn https_port(&self) -> u16 {
        self.https_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(443)
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            site: "www.localhost".to_string(),
            cache_dir: PathBuf::from("./certs"),
            allowed_hosts: vec![r"(www\.)?localhost".to_string()],
            host_policy: HostPolicyMode::Pattern,
            contact_email: None,
            server: ServerConfig {
                https_addr: "0.0.0.0:8443".to_string(),
                http_addr: "0.0.0.0:8080".to_string(),
                ..ServerConfig::default()
            },
            hosts: vec![HostRoute {
                route: r"^www\.localhost".to_string(),
                target: "http://127.0.0.1:3000".to_string(),
            }],
        }
    }

    /// Build the certificate policy described by this configuration
    pub fn host_policy(&self) -> Result<HostPolicy> {
        HostPolicy::from_config(self.host_policy, &self.allowed_hosts)
    }

    /// Validate configuration
    ///
    /// Every check here is fatal: a proxy must never start half-configured.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ProxyError::Config("No host routes configured".to_string()));
        }

        for host in &self.hosts {
            regex::Regex::new(&host.route).map_err(|e| {
                ProxyError::Config(format!("Invalid route pattern '{}': {}", host.route, e))
            })?;
            crate::backend::parse_target(&host.target)?;
        }

        self.host_policy()?;

        for addr in [&self.server.https_addr, &self.server.http_addr] {
            addr.parse::<SocketAddr>().map_err(|e| {
                ProxyError::Config(format!("Invalid listen address '{}': {}", addr, e))
            })?;
        }

        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::development()
    }
}
