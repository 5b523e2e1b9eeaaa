use std::net::SocketAddr;

use crate::{
    config::models::{DiscoverySourceConfig, GatewayConfig, HttpMappingConfig, LoggingConfig},
    core::{load_balancer::LoadBalancerKind, uri_template::UriTemplate},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

const KNOWN_PROTOCOLS: &[&str] = &["http", "mqtt", "stomp", "amqp", "openwire"];

/// Gateway configuration validator. Collects every problem instead of
/// stopping at the first one.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        if let Some(admin) = &config.admin {
            if let Err(e) = Self::validate_listen_address(&admin.listen_addr) {
                errors.push(e);
            }
            if admin.listen_addr == config.listen_addr {
                errors.push(ValidationError::InvalidField {
                    field: "admin.listen_addr".to_string(),
                    message: "must differ from listen_addr".to_string(),
                });
            }
        }

        for (field, value) in [
            ("connection_timeout", &config.connection_timeout),
            ("backend_connect_timeout", &config.backend_connect_timeout),
            ("http.request_timeout", &config.http.request_timeout),
            ("discovery.poll_interval", &config.discovery.poll_interval),
        ] {
            if let Err(e) = Self::validate_duration(field, value) {
                errors.push(e);
            }
        }

        errors.extend(Self::validate_protocols(&config.protocols));

        if config.tcp_load_balancer == LoadBalancerKind::Sticky && config.tcp_sticky_cache_size == 0
        {
            errors.push(ValidationError::InvalidField {
                field: "tcp_sticky_cache_size".to_string(),
                message: "sticky load balancing needs a cache size above zero".to_string(),
            });
        }

        for (i, mapping) in config.http.mappings.iter().enumerate() {
            errors.extend(Self::validate_mapping(i, mapping));
        }

        if let Some(external_url) = &config.http.external_url {
            if let Err(e) = Self::validate_url(external_url, "http.external_url", &["http", "https"])
            {
                errors.push(e);
            }
        }

        errors.extend(Self::validate_discovery(&config.discovery.source));

        if let Err(e) = Self::validate_logging(&config.logging) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_duration(field: &str, value: &str) -> ValidationResult<()> {
        match humantime::parse_duration(value) {
            Ok(duration) if duration.is_zero() => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: "must be greater than zero".to_string(),
            }),
            Ok(_) => Ok(()),
            Err(e) => Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("'{value}' is not a duration ({e})"),
            }),
        }
    }

    fn validate_protocols(protocols: &[String]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if protocols.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "protocols".to_string(),
            });
        }
        for protocol in protocols {
            if !KNOWN_PROTOCOLS.contains(&protocol.to_ascii_lowercase().as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: "protocols".to_string(),
                    message: format!(
                        "unknown protocol '{protocol}', expected one of {}",
                        KNOWN_PROTOCOLS.join(", ")
                    ),
                });
            }
        }
        errors
    }

    fn validate_mapping(index: usize, mapping: &HttpMappingConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = format!("http.mappings[{index}]");

        if let Err(e) = UriTemplate::new(&mapping.uri_template) {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.uri_template"),
                message: e.to_string(),
            });
        }
        if mapping.load_balancer == LoadBalancerKind::Sticky && mapping.sticky_cache_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{field}.sticky_cache_size"),
                message: "sticky load balancing needs a cache size above zero".to_string(),
            });
        }
        errors
    }

    fn validate_discovery(source: &DiscoverySourceConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        match source {
            DiscoverySourceConfig::Static { services } => {
                for service in services {
                    if service.name.is_empty() {
                        errors.push(ValidationError::MissingField {
                            field: "discovery.source.services[].name".to_string(),
                        });
                    }
                    for url in &service.urls {
                        if let Err(e) = url::Url::parse(url) {
                            errors.push(ValidationError::InvalidField {
                                field: format!("discovery service '{}' url", service.name),
                                message: format!("'{url}': {e}"),
                            });
                        }
                    }
                }
            }
            DiscoverySourceConfig::File { path } => {
                if path.is_empty() {
                    errors.push(ValidationError::MissingField {
                        field: "discovery.source.path".to_string(),
                    });
                }
            }
            DiscoverySourceConfig::Http { url, timeout } => {
                if let Err(e) = Self::validate_url(url, "discovery.source.url", &["http", "https"])
                {
                    errors.push(e);
                }
                if let Err(e) = Self::validate_duration("discovery.source.timeout", timeout) {
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str, schemes: &[&str]) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if !schemes.contains(&url.scheme()) {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be one of {}, got '{}'",
                            schemes.join(", "),
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_logging(logging: &LoggingConfig) -> ValidationResult<()> {
        tracing_subscriber::EnvFilter::try_new(&logging.level)
            .map(|_| ())
            .map_err(|e| ValidationError::InvalidField {
                field: "logging.level".to_string(),
                message: e.to_string(),
            })
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::AdminConfig;

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig {
            listen_addr: "127.0.0.1:8080".to_string(),
            ..GatewayConfig::default()
        }
    }

    fn failure_message(config: &GatewayConfig) -> String {
        match ConfigValidator::validate(config) {
            Err(ValidationError::ValidationFailed { message }) => message,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(ConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let mut config = minimal_valid_config();
        config.listen_addr = "localhost".to_string();
        assert!(failure_message(&config).contains("localhost"));
    }

    #[test]
    fn validate_rejects_zero_and_garbage_durations() {
        let mut config = minimal_valid_config();
        config.connection_timeout = "0s".to_string();
        config.discovery.poll_interval = "often".to_string();
        let message = failure_message(&config);
        assert!(message.starts_with("Found 2 validation errors"));
        assert!(message.contains("connection_timeout"));
        assert!(message.contains("discovery.poll_interval"));
    }

    #[test]
    fn validate_rejects_bad_template_and_unknown_protocol() {
        let mut config = minimal_valid_config();
        config.http.mappings.push(HttpMappingConfig::new("/bar/{version"));
        config.protocols.push("smtp".to_string());
        let message = failure_message(&config);
        assert!(message.contains("http.mappings[0].uri_template"));
        assert!(message.contains("smtp"));
    }

    #[test]
    fn validate_rejects_zero_sticky_cache() {
        let mut config = minimal_valid_config();
        let mut mapping = HttpMappingConfig::new("{contextPath}/");
        mapping.load_balancer = LoadBalancerKind::Sticky;
        mapping.sticky_cache_size = 0;
        config.http.mappings.push(mapping);
        assert!(failure_message(&config).contains("sticky_cache_size"));
    }

    #[test]
    fn validate_rejects_admin_on_gateway_port() {
        let mut config = minimal_valid_config();
        config.admin = Some(AdminConfig {
            listen_addr: config.listen_addr.clone(),
        });
        assert!(failure_message(&config).contains("admin.listen_addr"));
    }

    #[test]
    fn validate_checks_discovery_url() {
        let mut config = minimal_valid_config();
        config.discovery.source = DiscoverySourceConfig::Http {
            url: "ftp://registry".to_string(),
            timeout: "5s".to_string(),
        };
        assert!(failure_message(&config).contains("discovery.source.url"));
    }
}
