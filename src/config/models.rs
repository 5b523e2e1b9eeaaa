//! Configuration data structures for wiregate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! carry defaults everywhere, so a minimal config only names what differs.
//! Durations are humantime strings such as `"5s"` or `"250ms"`.
use std::time::Duration;

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    core::load_balancer::{DEFAULT_STICKY_CACHE_SIZE, LoadBalancerFactory, LoadBalancerKind},
    ports::discovery::ServiceDescriptor,
};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_connection_timeout() -> String {
    "5s".to_string()
}

fn default_backend_connect_timeout() -> String {
    "5s".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_poll_interval() -> String {
    "5s".to_string()
}

fn default_protocols() -> Vec<String> {
    ["http", "mqtt", "stomp", "amqp", "openwire"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_sticky_cache_size() -> usize {
    DEFAULT_STICKY_CACHE_SIZE
}

fn default_true() -> bool {
    true
}

pub(crate) fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .wrap_err_with(|| format!("Invalid duration for '{field}': {value}"))
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket the detecting gateway listens on (`IP:PORT`).
    pub listen_addr: String,
    /// How long a client may take to identify its protocol.
    pub connection_timeout: String,
    /// Timeout for opening a connection to a TCP backend.
    pub backend_connect_timeout: String,
    /// Version of this gateway; services of other versions stay hidden unless
    /// the URI template routes by `{version}`.
    pub gateway_version: Option<String>,
    /// Virtual host used for non-HTTP clients that do not announce one.
    pub default_virtual_host: Option<String>,
    /// Enabled protocols, in detection order.
    pub protocols: Vec<String>,
    /// Load balancer for non-HTTP connections.
    pub tcp_load_balancer: LoadBalancerKind,
    pub tcp_sticky_cache_size: usize,
    /// Try one more candidate when the first backend refuses the connection.
    pub retry_next_candidate: bool,
    pub http: HttpConfig,
    pub discovery: DiscoveryConfig,
    pub admin: Option<AdminConfig>,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connection_timeout: default_connection_timeout(),
            backend_connect_timeout: default_backend_connect_timeout(),
            gateway_version: None,
            default_virtual_host: None,
            protocols: default_protocols(),
            tcp_load_balancer: LoadBalancerKind::RoundRobin,
            tcp_sticky_cache_size: default_sticky_cache_size(),
            retry_next_candidate: false,
            http: HttpConfig::default(),
            discovery: DiscoveryConfig::default(),
            admin: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn connection_timeout(&self) -> Result<Duration> {
        parse_duration("connection_timeout", &self.connection_timeout)
    }

    pub fn backend_connect_timeout(&self) -> Result<Duration> {
        parse_duration("backend_connect_timeout", &self.backend_connect_timeout)
    }

    pub fn tcp_load_balancer_factory(&self) -> LoadBalancerFactory {
        LoadBalancerFactory::new(self.tcp_load_balancer, self.tcp_sticky_cache_size)
    }
}

/// HTTP reverse proxy settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub mappings: Vec<HttpMappingConfig>,
    /// Externally visible base URL (`scheme://host:port`) used when rewriting
    /// backend URLs in response headers. Defaults to `http://` + the request's
    /// `Host` header.
    pub external_url: Option<String>,
    /// Answer unmatched requests with a JSON index of the mapping table.
    pub show_mapping_index: bool,
    /// Upper bound for a single proxied request.
    pub request_timeout: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            mappings: Vec::new(),
            external_url: None,
            show_mapping_index: false,
            request_timeout: default_request_timeout(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration("http.request_timeout", &self.request_timeout)
    }
}

/// One HTTP mapping rule.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpMappingConfig {
    /// e.g. `/bar/{version}{contextPath}/`
    pub uri_template: String,
    #[serde(default)]
    pub load_balancer: LoadBalancerKind,
    #[serde(default = "default_sticky_cache_size")]
    pub sticky_cache_size: usize,
    /// Overrides `gateway_version` for this rule.
    #[serde(default)]
    pub enabled_version: Option<String>,
    #[serde(default = "default_true")]
    pub reverse_headers: bool,
}

impl HttpMappingConfig {
    pub fn new(uri_template: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            load_balancer: LoadBalancerKind::default(),
            sticky_cache_size: default_sticky_cache_size(),
            enabled_version: None,
            reverse_headers: true,
        }
    }

    pub fn load_balancer_factory(&self) -> LoadBalancerFactory {
        LoadBalancerFactory::new(self.load_balancer, self.sticky_cache_size)
    }
}

/// Where backend services come from.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub source: DiscoverySourceConfig,
    pub poll_interval: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            source: DiscoverySourceConfig::Static {
                services: Vec::new(),
            },
            poll_interval: default_poll_interval(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration("discovery.poll_interval", &self.poll_interval)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySourceConfig {
    /// Services listed inline.
    Static {
        #[serde(default)]
        services: Vec<ServiceDescriptor>,
    },
    /// A services file (JSON / YAML / TOML) re-read on every poll.
    File { path: String },
    /// A JSON array of services fetched over HTTP.
    Http {
        url: String,
        #[serde(default = "default_backend_connect_timeout")]
        timeout: String,
    },
}

/// Admin / observability endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    pub listen_addr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `wiregate=debug,hyper=warn`.
    pub level: String,
    pub json: bool,
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            include_spans: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.connection_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(config.protocols.len(), 5);
        assert_eq!(config.discovery.poll_interval().unwrap(), Duration::from_secs(5));
        assert!(config.http.mappings.is_empty());
    }

    #[test]
    fn test_mapping_defaults_from_json() {
        let mapping: HttpMappingConfig =
            serde_json::from_str(r#"{"uri_template": "/bar/{version}{contextPath}/"}"#).unwrap();
        assert_eq!(mapping.load_balancer, LoadBalancerKind::RoundRobin);
        assert_eq!(mapping.sticky_cache_size, DEFAULT_STICKY_CACHE_SIZE);
        assert!(mapping.reverse_headers);
        assert_eq!(mapping, HttpMappingConfig::new("/bar/{version}{contextPath}/"));
    }

    #[test]
    fn test_discovery_source_tagging() {
        let source: DiscoverySourceConfig =
            serde_json::from_str(r#"{"type": "http", "url": "http://registry/services"}"#)
                .unwrap();
        match source {
            DiscoverySourceConfig::Http { url, timeout } => {
                assert_eq!(url, "http://registry/services");
                assert_eq!(timeout, "5s");
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_invalid_duration() {
        let config = GatewayConfig {
            connection_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert!(config.connection_timeout().is_err());
    }
}
