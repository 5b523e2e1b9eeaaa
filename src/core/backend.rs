use std::{collections::HashMap, fmt, net::SocketAddr, str::FromStr};

use thiserror::Error;
use url::Url;

/// Errors related to backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A parsed backend service URL, e.g. `http://10.0.0.4:8183/cxf/crm` or
/// `mqtt://broker-1:1883`.
///
/// The original string is kept verbatim so it can be used as the identity of a
/// backend in mapping tables and load balancer caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    scheme: String,
    host: String,
    port: u16,
    context_path: String,
}

impl BackendUrl {
    /// Parse a backend URL. Host and a known (or explicit) port are required.
    pub fn new(url: &str) -> BackendResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BackendError::InvalidUrl(format!("{url}: missing host")))?
            .to_string();

        let scheme = parsed.scheme().to_ascii_lowercase();
        let port = parsed
            .port()
            .or_else(|| default_port(&scheme))
            .ok_or_else(|| BackendError::InvalidUrl(format!("{url}: missing port")))?;

        let context_path = parsed.path().trim_end_matches('/').to_string();

        Ok(BackendUrl {
            url: url.to_string(),
            scheme,
            host,
            port,
            context_path,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path component without a trailing slash (empty for the root path).
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    /// `host:port` suitable for opening a TCP connection.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.authority().parse().ok()
    }

    /// Everything before the context path, e.g. `http://backend-host:8183`.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }

    /// Template parameters describing this backend.
    pub fn template_params(&self) -> HashMap<String, String> {
        HashMap::from([
            ("contextPath".to_string(), self.context_path.clone()),
            ("protocol".to_string(), self.scheme.clone()),
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
        ])
    }

    /// Get the underlying URL as a string
    pub fn into_string(self) -> String {
        self.url
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "mqtt" => Some(1883),
        "stomp" => Some(61613),
        "amqp" => Some(5672),
        "amqps" => Some(5671),
        "openwire" => Some(61616),
        _ => None,
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_url_parts() {
        let url = BackendUrl::new("http://backend-host:8183/cxf/HelloWorld/").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host(), "backend-host");
        assert_eq!(url.port(), 8183);
        assert_eq!(url.context_path(), "/cxf/HelloWorld");
        assert_eq!(url.origin(), "http://backend-host:8183");
        assert_eq!(url.as_str(), "http://backend-host:8183/cxf/HelloWorld/");
    }

    #[test]
    fn test_backend_url_default_ports() {
        assert_eq!(BackendUrl::new("http://example.com").unwrap().port(), 80);
        assert_eq!(BackendUrl::new("mqtt://broker").unwrap().port(), 1883);
        assert_eq!(BackendUrl::new("tcp://10.0.0.1:61616").unwrap().port(), 61616);
        assert_eq!(BackendUrl::new("http://example.com").unwrap().context_path(), "");
    }

    #[test]
    fn test_backend_url_invalid() {
        assert!(BackendUrl::new("example.com").is_err());
        assert!(BackendUrl::new("tcp://10.0.0.1").is_err());
    }

    #[test]
    fn test_backend_url_socket_addr() {
        let url: BackendUrl = "tcp://127.0.0.1:9000".parse().unwrap();
        assert_eq!(url.socket_addr(), Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(BackendUrl::new("tcp://broker:1").unwrap().socket_addr(), None);
    }

    #[test]
    fn test_template_params() {
        let params = BackendUrl::new("http://h:1/a/b").unwrap().template_params();
        assert_eq!(params["contextPath"], "/a/b");
        assert_eq!(params["protocol"], "http");
        assert_eq!(params["host"], "h");
        assert_eq!(params["port"], "1");
    }
}
