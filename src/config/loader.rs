use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};
use serde::de::DeserializeOwned;

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, INI (by extension).
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    load_file(Path::new(config_path))
}

/// Deserialize any supported file into `T`.
pub(crate) fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            file_format(path),
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))
}

/// Determine file format based on extension, defaulting to YAML.
pub(crate) fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{config::models::DiscoverySourceConfig, core::load_balancer::LoadBalancerKind};

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:9000"
connection_timeout = "250ms"
gateway_version = "1.0"
protocols = ["mqtt", "http"]

[http]
external_url = "http://gateway-host:80"

[[http.mappings]]
uri_template = "/bar/{version}{contextPath}/"
load_balancer = "sticky"
sticky_cache_size = 64

[discovery]
poll_interval = "1s"

[discovery.source]
type = "file"
path = "/etc/wiregate/services.yaml"
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.connection_timeout().unwrap(), Duration::from_millis(250));
        assert_eq!(config.protocols, ["mqtt", "http"]);
        assert_eq!(config.http.mappings.len(), 1);
        assert_eq!(config.http.mappings[0].load_balancer, LoadBalancerKind::Sticky);
        assert_eq!(config.http.mappings[0].sticky_cache_size, 64);
        assert!(config.http.mappings[0].reverse_headers);
        assert!(matches!(
            config.discovery.source,
            DiscoverySourceConfig::File { ref path } if path == "/etc/wiregate/services.yaml"
        ));
    }

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:3000"
default_virtual_host: "broker"
tcp_load_balancer: "random"
discovery:
  source:
    type: "static"
    services:
      - name: "broker"
        urls: ["mqtt://10.0.0.1:1883"]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.default_virtual_host.as_deref(), Some("broker"));
        assert_eq!(config.tcp_load_balancer, LoadBalancerKind::Random);
        match config.discovery.source {
            DiscoverySourceConfig::Static { services } => {
                assert_eq!(services.len(), 1);
                assert_eq!(services[0].urls, ["mqtt://10.0.0.1:1883"]);
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(load_config_sync("/nonexistent/wiregate.toml").is_err());
    }
}
