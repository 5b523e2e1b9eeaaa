use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::ports::discovery::{
    DiscoveryError, DiscoveryResult, DiscoverySource, ServiceDescriptor,
};

/// Either a bare JSON array or `{"services": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServicesPayload {
    List(Vec<ServiceDescriptor>),
    Wrapped { services: Vec<ServiceDescriptor> },
}

/// Service list fetched from an HTTP endpoint on every poll.
pub struct HttpDiscovery {
    url: String,
    client: Client,
}

impl HttpDiscovery {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl DiscoverySource for HttpDiscovery {
    fn describe(&self) -> String {
        format!("http {}", self.url)
    }

    async fn services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;

        let payload = response
            .json::<ServicesPayload>()
            .await
            .map_err(|e| DiscoveryError::InvalidPayload(e.to_string()))?;

        Ok(match payload {
            ServicesPayload::List(services) | ServicesPayload::Wrapped { services } => services,
        })
    }
}
