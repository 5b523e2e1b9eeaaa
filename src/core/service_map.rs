//! Virtual host → backend group table used to route non-HTTP connections.
use std::{collections::BTreeMap, sync::Arc};

use scc::{HashMap as ConcurrentMap, hash_map::Entry};

use crate::core::{
    load_balancer::{LoadBalancer, LoadBalancerError, LoadBalancerFactory},
    protocol::Protocol,
};

/// The backends registered for one virtual host.
pub struct ServiceGroup {
    urls: Vec<String>,
    load_balancer: Arc<dyn LoadBalancer>,
}

impl ServiceGroup {
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// URLs whose scheme the protocol can speak, minus the ones in `exclude`.
    pub fn candidates(&self, protocol: &dyn Protocol, exclude: &[String]) -> Vec<String> {
        self.urls
            .iter()
            .filter(|url| {
                url.split_once("://")
                    .is_some_and(|(scheme, _)| protocol.serves_scheme(scheme))
            })
            .filter(|url| !exclude.contains(url))
            .cloned()
            .collect()
    }
}

pub struct ServiceMap {
    groups: ConcurrentMap<String, Arc<ServiceGroup>>,
    load_balancer: LoadBalancerFactory,
}

impl ServiceMap {
    pub fn new(load_balancer: LoadBalancerFactory) -> Self {
        Self {
            groups: ConcurrentMap::new(),
            load_balancer,
        }
    }

    /// Add or remove `urls` for a virtual host. Returns whether the table changed.
    pub fn update(&self, remove: bool, virtual_host: &str, urls: &[String]) -> bool {
        let mut changed = false;
        for url in urls {
            changed |= if remove {
                self.remove_url(virtual_host, url)
            } else {
                self.add_url(virtual_host, url)
            };
        }
        changed
    }

    fn add_url(&self, virtual_host: &str, url: &str) -> bool {
        match self.groups.entry(virtual_host.to_string()) {
            Entry::Occupied(mut occupied) => {
                let group = occupied.get();
                if group.urls.iter().any(|existing| existing == url) {
                    return false;
                }
                let mut urls = group.urls.clone();
                urls.push(url.to_string());
                let updated = Arc::new(ServiceGroup {
                    urls,
                    load_balancer: group.load_balancer.clone(),
                });
                *occupied.get_mut() = updated;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(Arc::new(ServiceGroup {
                    urls: vec![url.to_string()],
                    load_balancer: self.load_balancer.create(),
                }));
            }
        }
        true
    }

    fn remove_url(&self, virtual_host: &str, url: &str) -> bool {
        let Entry::Occupied(mut occupied) = self.groups.entry(virtual_host.to_string()) else {
            return false;
        };
        let group = occupied.get();
        if !group.urls.iter().any(|existing| existing == url) {
            return false;
        }
        let urls: Vec<String> = group
            .urls
            .iter()
            .filter(|existing| *existing != url)
            .cloned()
            .collect();
        if urls.is_empty() {
            occupied.remove();
        } else {
            let updated = Arc::new(ServiceGroup {
                urls,
                load_balancer: group.load_balancer.clone(),
            });
            *occupied.get_mut() = updated;
        }
        true
    }

    pub fn group(&self, virtual_host: &str) -> Option<Arc<ServiceGroup>> {
        self.groups.read(virtual_host, |_, group| group.clone())
    }

    /// Pick a backend of `virtual_host` able to serve `protocol`, skipping the
    /// URLs in `exclude`.
    pub fn choose(
        &self,
        virtual_host: &str,
        protocol: &dyn Protocol,
        request_key: &str,
        exclude: &[String],
    ) -> Result<String, LoadBalancerError> {
        let group = self
            .group(virtual_host)
            .ok_or(LoadBalancerError::NoBackendAvailable)?;
        let candidates = group.candidates(protocol, exclude);
        group.load_balancer.choose(&candidates, request_key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let mut view = BTreeMap::new();
        self.groups.scan(|virtual_host, group| {
            view.insert(virtual_host.clone(), group.urls.clone());
        });
        view
    }
}
