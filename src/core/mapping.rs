//! HTTP mapping rules: a URI template bound to the live backend sets of
//! discovered services.
//!
//! Each resolved path owns one [`MappedServices`] entry. Entries are never
//! mutated in place: every add or remove builds a new entry and swaps it in
//! under the bucket lock of the concurrent map, so a request that already
//! fetched an entry keeps routing against a complete backend list while the
//! discovery poller updates the table. There is no lock spanning the table.
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use parking_lot::RwLock;
use scc::{HashMap as ConcurrentMap, hash_map::Entry};
use serde::Serialize;

use crate::core::{
    backend::BackendUrl,
    load_balancer::{LoadBalancer, LoadBalancerError, LoadBalancerFactory},
    uri_template::UriTemplate,
};

/// Template parameter carrying the discovery service path.
pub const SERVICE_PATH_PARAM: &str = "servicePath";
/// Template parameter carrying the service version.
pub const VERSION_PARAM: &str = "version";

/// Metadata about the service group behind a mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceDetails {
    pub container: Option<String>,
    pub version: Option<String>,
}

/// The backend set currently routed for one resolved path.
pub struct MappedServices {
    service_urls: Vec<String>,
    details: ServiceDetails,
    load_balancer: Arc<dyn LoadBalancer>,
    reverse_headers: bool,
}

impl MappedServices {
    fn new(
        url: &str,
        details: ServiceDetails,
        load_balancer: Arc<dyn LoadBalancer>,
        reverse_headers: bool,
    ) -> Self {
        Self {
            service_urls: vec![url.to_string()],
            details,
            load_balancer,
            reverse_headers,
        }
    }

    /// Backend URLs in insertion order, without duplicates.
    pub fn service_urls(&self) -> &[String] {
        &self.service_urls
    }

    pub fn details(&self) -> &ServiceDetails {
        &self.details
    }

    pub fn reverse_headers(&self) -> bool {
        self.reverse_headers
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.load_balancer
    }

    pub fn contains(&self, url: &str) -> bool {
        self.service_urls.iter().any(|existing| existing == url)
    }

    /// Pick a backend for `request_key` among this entry's URLs.
    pub fn choose(&self, request_key: &str) -> Result<String, LoadBalancerError> {
        self.load_balancer.choose(&self.service_urls, request_key)
    }

    // The load balancer instance is carried over so round-robin counters and
    // sticky assignments survive topology changes.
    fn with_url(&self, url: &str, details: &ServiceDetails) -> Self {
        let mut service_urls = self.service_urls.clone();
        service_urls.push(url.to_string());
        Self {
            service_urls,
            details: details.clone(),
            load_balancer: self.load_balancer.clone(),
            reverse_headers: self.reverse_headers,
        }
    }

    fn without_url(&self, url: &str) -> Self {
        Self {
            service_urls: self
                .service_urls
                .iter()
                .filter(|existing| *existing != url)
                .cloned()
                .collect(),
            details: self.details.clone(),
            load_balancer: self.load_balancer.clone(),
            reverse_headers: self.reverse_headers,
        }
    }
}

impl fmt::Debug for MappedServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedServices")
            .field("service_urls", &self.service_urls)
            .field("details", &self.details)
            .field("load_balancer", &self.load_balancer.kind())
            .field("reverse_headers", &self.reverse_headers)
            .finish()
    }
}

/// Serializable view of one mapping, used by the admin API and the HTTP
/// not-found index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingView {
    pub service_urls: Vec<String>,
    pub container: Option<String>,
    pub version: Option<String>,
    pub load_balancer: String,
    pub reverse_headers: bool,
}

impl From<&MappedServices> for MappingView {
    fn from(services: &MappedServices) -> Self {
        Self {
            service_urls: services.service_urls.clone(),
            container: services.details.container.clone(),
            version: services.details.version.clone(),
            load_balancer: services.load_balancer.kind().to_string(),
            reverse_headers: services.reverse_headers,
        }
    }
}

/// Notified after a mapping rule's table changed.
pub trait MappingListener: Send + Sync + 'static {
    fn mappings_changed(&self, rule: &HttpMappingRule);
}

/// Owner of the resolved path → backend set table for one URI template.
pub struct HttpMappingRule {
    template: UriTemplate,
    gateway_version: Option<String>,
    enabled_version: Option<String>,
    load_balancer: LoadBalancerFactory,
    reverse_headers: bool,
    mappings: ConcurrentMap<String, Arc<MappedServices>>,
    listeners: RwLock<Vec<Arc<dyn MappingListener>>>,
}

impl HttpMappingRule {
    pub fn new(
        template: UriTemplate,
        load_balancer: LoadBalancerFactory,
        reverse_headers: bool,
    ) -> Self {
        Self {
            template,
            gateway_version: None,
            enabled_version: None,
            load_balancer,
            reverse_headers,
            mappings: ConcurrentMap::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn with_gateway_version(mut self, version: Option<String>) -> Self {
        self.gateway_version = version.filter(|v| !v.is_empty());
        self
    }

    pub fn with_enabled_version(mut self, version: Option<String>) -> Self {
        self.enabled_version = version.filter(|v| !v.is_empty());
        self
    }

    pub fn template(&self) -> &UriTemplate {
        &self.template
    }

    pub fn reverse_headers(&self) -> bool {
        self.reverse_headers
    }

    /// The version whose services are visible when the template does not
    /// carry `{version}` itself.
    pub fn active_version(&self) -> Option<&str> {
        self.enabled_version
            .as_deref()
            .or(self.gateway_version.as_deref())
    }

    pub fn add_listener(&self, listener: Arc<dyn MappingListener>) {
        self.listeners.write().push(listener);
    }

    /// Apply one discovery event for `service_path`.
    ///
    /// Returns whether the table changed; listeners are notified only then.
    pub fn update_mapping_rules(
        &self,
        remove: bool,
        service_path: &str,
        urls: &[String],
        params: &HashMap<String, String>,
        details: &ServiceDetails,
    ) -> bool {
        let remove = remove || self.is_hidden_version(params);

        let mut changed = false;
        for url in urls {
            let backend = match BackendUrl::new(url) {
                Ok(backend) => backend,
                Err(err) => {
                    tracing::warn!(service_path, error = %err, "Skipping invalid service URL");
                    continue;
                }
            };
            let path = self.resolve_path(service_path, &backend, params);
            changed |= if remove {
                self.remove_url(&path, url)
            } else {
                self.add_url(&path, url, details)
            };
        }

        if changed {
            tracing::debug!(
                template = %self.template,
                service_path,
                remove,
                paths = self.mappings.len(),
                "Mapping rules updated"
            );
            self.notify_listeners();
        }
        changed
    }

    fn is_hidden_version(&self, params: &HashMap<String, String>) -> bool {
        if self.template.has_parameter(VERSION_PARAM) {
            return false;
        }
        match self.active_version() {
            Some(active) => params.get(VERSION_PARAM).map(String::as_str) != Some(active),
            None => false,
        }
    }

    fn resolve_path(
        &self,
        service_path: &str,
        backend: &BackendUrl,
        params: &HashMap<String, String>,
    ) -> String {
        let mut bindings = params.clone();
        bindings.insert(SERVICE_PATH_PARAM.to_string(), service_path.to_string());
        bindings.extend(backend.template_params());
        self.template.bind(&bindings)
    }

    fn add_url(&self, path: &str, url: &str, details: &ServiceDetails) -> bool {
        match self.mappings.entry(path.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().contains(url) {
                    return false;
                }
                let updated = Arc::new(occupied.get().with_url(url, details));
                *occupied.get_mut() = updated;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(Arc::new(MappedServices::new(
                    url,
                    details.clone(),
                    self.load_balancer.create(),
                    self.reverse_headers,
                )));
            }
        }
        true
    }

    fn remove_url(&self, path: &str, url: &str) -> bool {
        let Entry::Occupied(mut occupied) = self.mappings.entry(path.to_string()) else {
            return false;
        };
        if !occupied.get().contains(url) {
            return false;
        }
        let remaining = occupied.get().without_url(url);
        if remaining.service_urls.is_empty() {
            occupied.remove();
        } else {
            *occupied.get_mut() = Arc::new(remaining);
        }
        true
    }

    fn notify_listeners(&self) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.mappings_changed(self);
        }
    }

    /// Longest registered path that prefixes `request_path` on a segment
    /// boundary. A request for the path without its trailing slash matches too.
    pub fn find(&self, request_path: &str) -> Option<(String, Arc<MappedServices>)> {
        let mut best: Option<(String, Arc<MappedServices>)> = None;
        self.mappings.scan(|path, services| {
            let matched = covers(path, request_path);
            let longer = best
                .as_ref()
                .is_none_or(|(current, _)| path.len() > current.len());
            if matched && longer {
                best = Some((path.clone(), services.clone()));
            }
        });
        best
    }

    pub fn get(&self, path: &str) -> Option<Arc<MappedServices>> {
        self.mappings.read(path, |_, services| services.clone())
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Point-in-time copy of the table, sorted by path.
    pub fn snapshot(&self) -> BTreeMap<String, MappingView> {
        let mut views = BTreeMap::new();
        self.mappings.scan(|path, services| {
            views.insert(path.clone(), MappingView::from(services.as_ref()));
        });
        views
    }
}

impl fmt::Debug for HttpMappingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMappingRule")
            .field("template", &self.template)
            .field("gateway_version", &self.gateway_version)
            .field("enabled_version", &self.enabled_version)
            .field("load_balancer", &self.load_balancer)
            .field("reverse_headers", &self.reverse_headers)
            .field("paths", &self.mappings.len())
            .finish()
    }
}

fn covers(path: &str, request_path: &str) -> bool {
    match request_path.strip_prefix(path) {
        Some(rest) => path.ends_with('/') || rest.is_empty() || rest.starts_with(['/', '?']),
        None => path.trim_end_matches('/') == request_path,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::load_balancer::LoadBalancerKind;

    fn rule(template: &str) -> HttpMappingRule {
        HttpMappingRule::new(
            UriTemplate::new(template).unwrap(),
            LoadBalancerFactory::new(LoadBalancerKind::RoundRobin, 16),
            true,
        )
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_add_resolves_template_per_url() {
        let rule = rule("/bar/{version}{contextPath}/");
        let changed = rule.update_mapping_rules(
            false,
            "/services/crm",
            &urls(&["http://10.0.0.1:8183/cxf/crm", "http://10.0.0.2:8183/cxf/crm"]),
            &params(&[("version", "1.0")]),
            &ServiceDetails::default(),
        );
        assert!(changed);
        assert_eq!(rule.len(), 1);

        let services = rule.get("/bar/1.0/cxf/crm/").unwrap();
        assert_eq!(
            services.service_urls(),
            ["http://10.0.0.1:8183/cxf/crm", "http://10.0.0.2:8183/cxf/crm"]
        );
        assert!(services.reverse_headers());
    }

    #[test]
    fn test_add_is_idempotent_and_unions() {
        let rule = rule("{contextPath}/");
        let details = ServiceDetails::default();
        let p = HashMap::new();

        assert!(rule.update_mapping_rules(false, "a", &urls(&["http://h1:1/api"]), &p, &details));
        assert!(!rule.update_mapping_rules(false, "a", &urls(&["http://h1:1/api"]), &p, &details));
        assert!(rule.update_mapping_rules(false, "b", &urls(&["http://h2:1/api"]), &p, &details));

        let services = rule.get("/api/").unwrap();
        assert_eq!(services.service_urls(), ["http://h1:1/api", "http://h2:1/api"]);
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let rule = rule("/bar/{version}{contextPath}/");
        let p = params(&[("version", "1.0")]);
        let details = ServiceDetails::default();
        let first = urls(&["http://a:1/x", "http://b:1/x"]);
        let second = urls(&["http://c:1/y"]);

        rule.update_mapping_rules(false, "/s", &first, &p, &details);
        rule.update_mapping_rules(false, "/s", &second, &p, &details);
        assert_eq!(rule.len(), 2);

        // removal order differs from insertion order
        rule.update_mapping_rules(true, "/s", &second, &p, &details);
        rule.update_mapping_rules(true, "/s", &urls(&["http://b:1/x"]), &p, &details);
        assert_eq!(rule.get("/bar/1.0/x/").unwrap().service_urls(), ["http://a:1/x"]);
        rule.update_mapping_rules(true, "/s", &urls(&["http://a:1/x"]), &p, &details);

        assert!(rule.is_empty());
        assert!(rule.find("/bar/1.0/x/anything").is_none());
    }

    #[test]
    fn test_mismatched_version_is_hidden() {
        let rule = rule("{contextPath}/").with_gateway_version(Some("1.0".to_string()));
        let details = ServiceDetails::default();

        rule.update_mapping_rules(
            false,
            "/s",
            &urls(&["http://old:1/crm"]),
            &params(&[("version", "1.1")]),
            &details,
        );
        assert!(rule.is_empty());

        rule.update_mapping_rules(
            false,
            "/s",
            &urls(&["http://new:1/crm"]),
            &params(&[("version", "1.0")]),
            &details,
        );
        assert_eq!(rule.get("/crm/").unwrap().service_urls(), ["http://new:1/crm"]);

        // a later add of a mismatched version removes a URL it had already published
        rule.update_mapping_rules(
            false,
            "/s",
            &urls(&["http://new:1/crm"]),
            &params(&[("version", "2.0")]),
            &details,
        );
        assert!(rule.is_empty());
    }

    #[test]
    fn test_enabled_version_overrides_gateway_version() {
        let rule = rule("{contextPath}/")
            .with_gateway_version(Some("1.0".to_string()))
            .with_enabled_version(Some("1.1".to_string()));
        assert_eq!(rule.active_version(), Some("1.1"));

        rule.update_mapping_rules(
            false,
            "/s",
            &urls(&["http://svc:1/crm"]),
            &params(&[("version", "1.1")]),
            &ServiceDetails::default(),
        );
        assert_eq!(rule.len(), 1);
    }

    #[test]
    fn test_versioned_template_shows_all_versions() {
        let rule =
            rule("/bar/{version}{contextPath}/").with_gateway_version(Some("1.0".to_string()));
        let details = ServiceDetails::default();
        rule.update_mapping_rules(false, "/s", &urls(&["http://a:1/x"]), &params(&[("version", "1.0")]), &details);
        rule.update_mapping_rules(false, "/s", &urls(&["http://b:1/x"]), &params(&[("version", "1.1")]), &details);
        assert_eq!(rule.len(), 2);
    }

    #[test]
    fn test_find_longest_prefix() {
        let rule = rule("{contextPath}/");
        let p = HashMap::new();
        let details = ServiceDetails::default();
        rule.update_mapping_rules(false, "/s", &urls(&["http://a:1/api"]), &p, &details);
        rule.update_mapping_rules(false, "/s", &urls(&["http://b:1/api/v2"]), &p, &details);

        let (path, services) = rule.find("/api/v2/users?id=1").unwrap();
        assert_eq!(path, "/api/v2/");
        assert_eq!(services.service_urls(), ["http://b:1/api/v2"]);

        assert_eq!(rule.find("/api/users").unwrap().0, "/api/");
        assert_eq!(rule.find("/api").unwrap().0, "/api/");
        assert!(rule.find("/apix").is_none());
    }

    #[test]
    fn test_find_respects_segment_boundaries() {
        let rule = rule("/api{contextPath}");
        let p = HashMap::new();
        let details = ServiceDetails::default();
        rule.update_mapping_rules(false, "/s", &urls(&["http://b:1/crm"]), &p, &details);

        assert_eq!(rule.find("/api/crm").unwrap().0, "/api/crm");
        assert_eq!(rule.find("/api/crm/customers").unwrap().0, "/api/crm");
        assert_eq!(rule.find("/api/crm?id=7").unwrap().0, "/api/crm");
        assert!(rule.find("/api/crmx/secret").is_none());
    }

    #[test]
    fn test_load_balancer_survives_updates() {
        let rule = rule("{contextPath}/");
        let p = HashMap::new();
        let details = ServiceDetails::default();
        rule.update_mapping_rules(false, "/s", &urls(&["http://a:1/x", "http://b:1/x"]), &p, &details);

        let before = rule.get("/x/").unwrap();
        assert_eq!(before.choose("k").unwrap(), "http://a:1/x");

        rule.update_mapping_rules(false, "/s", &urls(&["http://c:1/x"]), &p, &details);
        let after = rule.get("/x/").unwrap();
        assert!(Arc::ptr_eq(before.load_balancer(), after.load_balancer()));
        assert_eq!(after.choose("k").unwrap(), "http://b:1/x");

        // a reader holding the old entry still sees its complete list
        assert_eq!(before.service_urls().len(), 2);
    }

    #[test]
    fn test_invalid_urls_are_skipped() {
        let rule = rule("{contextPath}/");
        let changed = rule.update_mapping_rules(
            false,
            "/s",
            &urls(&["not a url", "http://ok:1/x"]),
            &HashMap::new(),
            &ServiceDetails::default(),
        );
        assert!(changed);
        assert_eq!(rule.len(), 1);
    }

    #[test]
    fn test_listeners_fire_after_change_only() {
        struct Counting(AtomicUsize);
        impl MappingListener for Counting {
            fn mappings_changed(&self, rule: &HttpMappingRule) {
                assert!(rule.get("/x/").is_some() || rule.is_empty());
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let rule = rule("{contextPath}/");
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        rule.add_listener(listener.clone());

        let p = HashMap::new();
        let details = ServiceDetails::default();
        rule.update_mapping_rules(false, "/s", &urls(&["http://a:1/x"]), &p, &details);
        rule.update_mapping_rules(false, "/s", &urls(&["http://a:1/x"]), &p, &details);
        rule.update_mapping_rules(true, "/s", &urls(&["http://a:1/x"]), &p, &details);
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_view() {
        let rule = rule("{contextPath}/");
        rule.update_mapping_rules(
            false,
            "/s",
            &urls(&["http://a:1/x"]),
            &HashMap::new(),
            &ServiceDetails {
                container: Some("node-1".to_string()),
                version: Some("1.0".to_string()),
            },
        );
        let snapshot = rule.snapshot();
        let view = &snapshot["/x/"];
        assert_eq!(view.container.as_deref(), Some("node-1"));
        assert_eq!(view.load_balancer, "round-robin");
        assert_eq!(view.service_urls, ["http://a:1/x"]);
    }
}
