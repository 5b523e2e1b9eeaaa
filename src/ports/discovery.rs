use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::core::mapping::ServiceDetails;

/// Errors raised by discovery sources
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The source could not be reached or read
    #[error("Discovery source unavailable: {0}")]
    Unavailable(String),

    /// The source answered with something that is not a service list
    #[error("Invalid discovery payload: {0}")]
    InvalidPayload(String),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// One logical service as reported by a discovery source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Selector labels, e.g. `version`, `container`, `virtualHost`.
    pub labels: BTreeMap<String, String>,
    pub urls: Vec<String>,
    /// Ports used for URLs that do not name one.
    pub ports: Vec<u16>,
}

impl ServiceDescriptor {
    /// Label lookup; names compare case-insensitively.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    /// Virtual host serving non-HTTP connections: label `virtualHost`, else the name.
    pub fn virtual_host(&self) -> &str {
        self.label("virtualHost").unwrap_or(&self.name)
    }

    /// Value bound to `{servicePath}`: label `servicePath`, else the name.
    pub fn service_path(&self) -> &str {
        self.label("servicePath").unwrap_or(&self.name)
    }

    pub fn details(&self) -> ServiceDetails {
        ServiceDetails {
            container: self.label("container").map(str::to_string),
            version: self.label("version").map(str::to_string),
        }
    }

    /// URI template parameters: every label plus `name`.
    pub fn template_params(&self) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = self
            .labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        params.insert("name".to_string(), self.name.clone());
        params
    }

    /// Backend URLs with port-less entries expanded once per declared port.
    pub fn expanded_urls(&self) -> Vec<String> {
        let mut expanded = Vec::with_capacity(self.urls.len());
        for raw in &self.urls {
            if self.ports.is_empty() || has_explicit_port(raw) {
                push_unique(&mut expanded, raw.clone());
                continue;
            }
            match Url::parse(raw) {
                Ok(url) => {
                    for port in &self.ports {
                        let mut with_port = url.clone();
                        if with_port.set_port(Some(*port)).is_ok() {
                            push_unique(&mut expanded, with_port.to_string());
                        } else {
                            push_unique(&mut expanded, raw.clone());
                        }
                    }
                }
                Err(_) => push_unique(&mut expanded, raw.clone()),
            }
        }
        expanded
    }
}

fn push_unique(urls: &mut Vec<String>, url: String) {
    if !urls.contains(&url) {
        urls.push(url);
    }
}

fn has_explicit_port(raw: &str) -> bool {
    let Some((_, rest)) = raw.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    match host_port.rfind(']') {
        Some(bracket) => host_port[bracket..].contains(':'),
        None => host_port.contains(':'),
    }
}

/// Port supplying the current set of backend services.
#[async_trait]
pub trait DiscoverySource: Send + Sync + 'static {
    /// Short description used in logs.
    fn describe(&self) -> String;

    /// Fetch the complete current service list.
    async fn services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>>;
}
