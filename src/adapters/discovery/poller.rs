//! Periodic discovery loop feeding the routing tables.
//!
//! Each poll fetches the full service list, compares it with the list applied
//! by the previous successful poll and turns the difference into remove/add
//! updates on the [`GatewayService`]. Adds are idempotent, so every present
//! URL is re-added on each poll. A failed poll changes nothing.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr};
use tokio::time::MissedTickBehavior;

use super::{FileDiscovery, HttpDiscovery, StaticDiscovery};
use crate::{
    config::{DiscoveryConfig, DiscoverySourceConfig, models::parse_duration},
    core::{GatewayService, ServiceRegistration},
    metrics,
    ports::discovery::{DiscoveryResult, DiscoverySource, ServiceDescriptor},
    utils::ShutdownToken,
};

pub struct DiscoveryPoller {
    source: Arc<dyn DiscoverySource>,
    gateway: Arc<GatewayService>,
    poll_interval: Duration,
    applied: ArcSwap<Vec<ServiceDescriptor>>,
}

impl DiscoveryPoller {
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        gateway: Arc<GatewayService>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            gateway,
            poll_interval,
            applied: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Build the poller and its source from the `[discovery]` section.
    pub fn from_config(config: &DiscoveryConfig, gateway: Arc<GatewayService>) -> Result<Self> {
        let source: Arc<dyn DiscoverySource> = match &config.source {
            DiscoverySourceConfig::Static { services } => {
                Arc::new(StaticDiscovery::new(services.clone()))
            }
            DiscoverySourceConfig::File { path } => Arc::new(FileDiscovery::new(path)),
            DiscoverySourceConfig::Http { url, timeout } => Arc::new(HttpDiscovery::new(
                url.clone(),
                parse_duration("discovery.source.timeout", timeout)?,
            )),
        };
        let poll_interval = config
            .poll_interval()
            .wrap_err("Invalid discovery poll interval")?;
        Ok(Self::new(source, gateway, poll_interval))
    }

    /// The service list applied by the last successful poll.
    pub fn services(&self) -> Arc<Vec<ServiceDescriptor>> {
        self.applied.load_full()
    }

    /// Fetch once and apply the changes. Returns the number of services now
    /// known. On error the routing tables are left untouched.
    pub async fn poll_once(&self) -> DiscoveryResult<usize> {
        let current = match self.source.services().await {
            Ok(services) => services,
            Err(e) => {
                metrics::increment_discovery_failures();
                tracing::warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "Discovery poll failed, keeping last known services"
                );
                return Err(e);
            }
        };

        let previous = self.applied.load_full();
        let removed = self.apply(&previous, &current);
        if removed > 0 || previous.as_slice() != current.as_slice() {
            tracing::info!(
                source = %self.source.describe(),
                services = current.len(),
                removed_urls = removed,
                "Discovery snapshot applied"
            );
        }

        let count = current.len();
        self.applied.store(Arc::new(current));
        Ok(count)
    }

    /// Poll until shutdown. The first poll happens immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            source = %self.source.describe(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Discovery poller started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // failures are logged and counted inside
                    let _ = self.poll_once().await;
                }
                reason = shutdown.wait_for_shutdown() => {
                    tracing::info!(?reason, "Discovery poller stopping");
                    break;
                }
            }
        }
    }

    /// Returns the number of URLs removed.
    fn apply(&self, previous: &[ServiceDescriptor], current: &[ServiceDescriptor]) -> usize {
        let current_by_name: BTreeMap<&str, &ServiceDescriptor> = current
            .iter()
            .map(|service| (service.name.as_str(), service))
            .collect();

        let mut removed = 0;
        for old in previous {
            let old_urls = old.expanded_urls();
            let vanished: Vec<String> = match current_by_name.get(old.name.as_str()) {
                // same labels resolve to the same paths: drop only missing URLs
                Some(new) if new.labels == old.labels => {
                    let new_urls = new.expanded_urls();
                    old_urls
                        .into_iter()
                        .filter(|url| !new_urls.contains(url))
                        .collect()
                }
                _ => old_urls,
            };
            if vanished.is_empty() {
                continue;
            }
            removed += vanished.len();
            tracing::debug!(service = %old.name, urls = ?vanished, "Removing backend URLs");
            self.gateway
                .apply_service_update(true, &registration(old, vanished));
        }

        for service in current_by_name.values() {
            self.gateway
                .apply_service_update(false, &registration(service, service.expanded_urls()));
        }
        removed
    }
}

fn registration(service: &ServiceDescriptor, urls: Vec<String>) -> ServiceRegistration {
    ServiceRegistration {
        service_path: service.service_path().to_string(),
        virtual_host: service.virtual_host().to_string(),
        urls,
        params: service.template_params(),
        details: service.details(),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::{GatewayConfig, HttpMappingConfig},
        ports::discovery::DiscoveryError,
    };

    /// Source replaying a scripted sequence of poll results.
    struct ScriptedSource {
        results: Mutex<Vec<DiscoveryResult<Vec<ServiceDescriptor>>>>,
    }

    impl ScriptedSource {
        fn new(mut results: Vec<DiscoveryResult<Vec<ServiceDescriptor>>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl DiscoverySource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>> {
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(DiscoveryError::Unavailable("script exhausted".into())))
        }
    }

    fn service(name: &str, version: &str, urls: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            labels: BTreeMap::from([("version".to_string(), version.to_string())]),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            ports: Vec::new(),
        }
    }

    fn gateway() -> Arc<GatewayService> {
        let mut config = GatewayConfig::default();
        config
            .http
            .mappings
            .push(HttpMappingConfig::new("/{version}{contextPath}/"));
        Arc::new(GatewayService::new(&config).unwrap())
    }

    fn poller(
        gateway: &Arc<GatewayService>,
        results: Vec<DiscoveryResult<Vec<ServiceDescriptor>>>,
    ) -> DiscoveryPoller {
        DiscoveryPoller::new(
            Arc::new(ScriptedSource::new(results)),
            gateway.clone(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_vanished_urls_are_removed() {
        let gateway = gateway();
        let poller = poller(
            &gateway,
            vec![
                Ok(vec![service("crm", "1.0", &["http://a:1/crm", "http://b:1/crm"])]),
                Ok(vec![service("crm", "1.0", &["http://b:1/crm"])]),
                Ok(vec![]),
            ],
        );

        assert_eq!(poller.poll_once().await.unwrap(), 1);
        let rule = &gateway.http_rules()[0];
        assert_eq!(rule.get("/1.0/crm/").unwrap().service_urls().len(), 2);

        poller.poll_once().await.unwrap();
        assert_eq!(rule.get("/1.0/crm/").unwrap().service_urls(), ["http://b:1/crm"]);

        assert_eq!(poller.poll_once().await.unwrap(), 0);
        assert!(rule.is_empty());
        assert!(gateway.service_map().is_empty());
    }

    #[tokio::test]
    async fn test_label_change_moves_paths() {
        let gateway = gateway();
        let poller = poller(
            &gateway,
            vec![
                Ok(vec![service("crm", "1.0", &["http://a:1/crm"])]),
                Ok(vec![service("crm", "2.0", &["http://a:1/crm"])]),
            ],
        );
        poller.poll_once().await.unwrap();
        poller.poll_once().await.unwrap();

        let rule = &gateway.http_rules()[0];
        assert!(rule.get("/1.0/crm/").is_none());
        assert!(rule.get("/2.0/crm/").is_some());
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_routing_table() {
        let gateway = gateway();
        let poller = poller(
            &gateway,
            vec![
                Ok(vec![service("crm", "1.0", &["http://a:1/crm"])]),
                Err(DiscoveryError::Unavailable("registry down".into())),
            ],
        );
        poller.poll_once().await.unwrap();
        assert!(poller.poll_once().await.is_err());

        assert!(gateway.http_rules()[0].get("/1.0/crm/").is_some());
        assert_eq!(poller.services().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let gateway = gateway();
        let poller = Arc::new(poller(
            &gateway,
            vec![Ok(vec![service("crm", "1.0", &["http://a:1/crm"])])],
        ));
        let shutdown = crate::utils::GracefulShutdown::new();
        let task = tokio::spawn(poller.clone().run(shutdown.shutdown_token()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger_shutdown(crate::utils::ShutdownReason::Graceful);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        // later polls failed; the first snapshot survives
        assert!(gateway.http_rules()[0].get("/1.0/crm/").is_some());
    }
}
