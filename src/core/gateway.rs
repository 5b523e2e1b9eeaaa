//! Core gateway orchestration service.
//!
//! `GatewayService` is the process-wide registry wiring the routing state
//! together: the protocol registry, the HTTP mapping rules, the virtual host
//! service map and the connection statistics. It is built once from the
//! configuration, shared behind an `Arc`, and performs no I/O itself, so the
//! adapters (acceptor, HTTP proxy, discovery poller, admin API) stay thin.
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use eyre::{Result, WrapErr};
use serde::Serialize;

use crate::{
    config::GatewayConfig,
    core::{
        load_balancer::LoadBalancerError,
        mapping::{HttpMappingRule, MappedServices, MappingListener, MappingView, ServiceDetails},
        protocol::{ConnectionParameters, Protocol, ProtocolRegistry},
        service_map::ServiceMap,
        uri_template::UriTemplate,
    },
    metrics,
    utils::ConnectionTracker,
};

/// One discovered service translated into routing terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRegistration {
    /// Bound to `{servicePath}` in URI templates.
    pub service_path: String,
    /// Group used for non-HTTP routing.
    pub virtual_host: String,
    pub urls: Vec<String>,
    /// URI template parameters (labels plus `name`).
    pub params: HashMap<String, String>,
    pub details: ServiceDetails,
}

/// Keeps the mapped-paths gauge current and logs table changes.
struct MappedPathsReporter;

impl MappingListener for MappedPathsReporter {
    fn mappings_changed(&self, rule: &HttpMappingRule) {
        metrics::set_mapped_paths(rule.template().as_str(), rule.len());
        tracing::info!(
            template = %rule.template(),
            paths = rule.len(),
            "HTTP mapping table changed"
        );
    }
}

/// Central registry for routing state, constructed explicitly and shared by
/// every adapter.
pub struct GatewayService {
    registry: ProtocolRegistry,
    http_rules: Vec<Arc<HttpMappingRule>>,
    service_map: ServiceMap,
    tracker: Arc<ConnectionTracker>,
    default_virtual_host: Option<String>,
    retry_next_candidate: bool,
    backend_connect_timeout: Duration,
}

impl GatewayService {
    /// Build the routing state from a (validated) configuration.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let defaults = ProtocolRegistry::with_defaults();
        let mut registry = ProtocolRegistry::new();
        for name in &config.protocols {
            let protocol = defaults
                .get(name)
                .ok_or_else(|| eyre::eyre!("Unknown protocol '{name}'"))?;
            registry.register(protocol);
        }

        let mut http_rules = Vec::with_capacity(config.http.mappings.len());
        for mapping in &config.http.mappings {
            let template = UriTemplate::new(&mapping.uri_template)
                .wrap_err_with(|| format!("Invalid URI template '{}'", mapping.uri_template))?;
            let rule = HttpMappingRule::new(
                template,
                mapping.load_balancer_factory(),
                mapping.reverse_headers,
            )
            .with_gateway_version(config.gateway_version.clone())
            .with_enabled_version(mapping.enabled_version.clone());
            http_rules.push(Arc::new(rule));
        }

        let tracker = Arc::new(ConnectionTracker::new(config.connection_timeout()?));

        Ok(Self::from_parts(
            registry,
            http_rules,
            ServiceMap::new(config.tcp_load_balancer_factory()),
            tracker,
        )
        .with_default_virtual_host(config.default_virtual_host.clone())
        .with_retry_next_candidate(config.retry_next_candidate)
        .with_backend_connect_timeout(config.backend_connect_timeout()?))
    }

    /// Assemble a service from already built parts.
    pub fn from_parts(
        registry: ProtocolRegistry,
        http_rules: Vec<Arc<HttpMappingRule>>,
        service_map: ServiceMap,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        let reporter: Arc<dyn MappingListener> = Arc::new(MappedPathsReporter);
        for rule in &http_rules {
            rule.add_listener(reporter.clone());
        }
        Self {
            registry,
            http_rules,
            service_map,
            tracker,
            default_virtual_host: None,
            retry_next_candidate: false,
            backend_connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_default_virtual_host(mut self, virtual_host: Option<String>) -> Self {
        self.default_virtual_host = virtual_host.filter(|v| !v.is_empty());
        self
    }

    pub fn with_retry_next_candidate(mut self, retry: bool) -> Self {
        self.retry_next_candidate = retry;
        self
    }

    pub fn with_backend_connect_timeout(mut self, timeout: Duration) -> Self {
        self.backend_connect_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn http_rules(&self) -> &[Arc<HttpMappingRule>] {
        &self.http_rules
    }

    pub fn service_map(&self) -> &ServiceMap {
        &self.service_map
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn retry_next_candidate(&self) -> bool {
        self.retry_next_candidate
    }

    pub fn backend_connect_timeout(&self) -> Duration {
        self.backend_connect_timeout
    }

    /// Feed one discovery event into every mapping rule and the service map.
    ///
    /// Only `http`/`https` URLs reach the HTTP mapping rules.
    pub fn apply_service_update(&self, remove: bool, registration: &ServiceRegistration) {
        let http_urls: Vec<String> = registration
            .urls
            .iter()
            .filter(|url| is_http_url(url))
            .cloned()
            .collect();
        for rule in &self.http_rules {
            if http_urls.is_empty() {
                break;
            }
            rule.update_mapping_rules(
                remove,
                &registration.service_path,
                &http_urls,
                &registration.params,
                &registration.details,
            );
        }
        if self
            .service_map
            .update(remove, &registration.virtual_host, &registration.urls)
        {
            tracing::debug!(
                virtual_host = %registration.virtual_host,
                remove,
                "Service map updated"
            );
        }
    }

    /// Longest matching HTTP mapping across all rules.
    pub fn find_http_mapping(&self, path: &str) -> Option<(String, Arc<MappedServices>)> {
        self.http_rules
            .iter()
            .filter_map(|rule| rule.find(path))
            .max_by_key(|(prefix, _)| prefix.len())
    }

    /// Virtual host a non-HTTP connection is routed to.
    pub fn virtual_host_for<'a>(&'a self, params: &'a ConnectionParameters) -> Option<&'a str> {
        params
            .virtual_host
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(self.default_virtual_host.as_deref())
    }

    /// Pick a backend for a non-HTTP connection, skipping `exclude`.
    ///
    /// The sticky key is the client id when the protocol announced one, else
    /// the client IP.
    pub fn choose_tcp_backend(
        &self,
        protocol: &dyn Protocol,
        params: &ConnectionParameters,
        peer: SocketAddr,
        exclude: &[String],
    ) -> Result<String, LoadBalancerError> {
        let virtual_host = self
            .virtual_host_for(params)
            .ok_or(LoadBalancerError::NoBackendAvailable)?;
        let request_key = params
            .client_id
            .clone()
            .unwrap_or_else(|| peer.ip().to_string());
        self.service_map
            .choose(virtual_host, protocol, &request_key, exclude)
    }

    pub fn mapped_path_count(&self) -> usize {
        self.http_rules.iter().map(|rule| rule.len()).sum()
    }

    /// Serializable view of every routing table.
    pub fn mappings_snapshot(&self) -> MappingsSnapshot {
        MappingsSnapshot {
            http: self
                .http_rules
                .iter()
                .map(|rule| HttpRuleSnapshot {
                    uri_template: rule.template().to_string(),
                    active_version: rule.active_version().map(str::to_string),
                    paths: rule.snapshot(),
                })
                .collect(),
            virtual_hosts: self.service_map.snapshot(),
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.split_once("://").is_some_and(|(scheme, _)| {
        scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRuleSnapshot {
    pub uri_template: String,
    pub active_version: Option<String>,
    pub paths: BTreeMap<String, MappingView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MappingsSnapshot {
    pub http: Vec<HttpRuleSnapshot>,
    pub virtual_hosts: BTreeMap<String, Vec<String>>,
}
