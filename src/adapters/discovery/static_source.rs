use async_trait::async_trait;

use crate::ports::discovery::{DiscoveryResult, DiscoverySource, ServiceDescriptor};

/// Services listed inline in the gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: Vec<ServiceDescriptor>,
}

impl StaticDiscovery {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    fn describe(&self) -> String {
        format!("static ({} services)", self.services.len())
    }

    async fn services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>> {
        Ok(self.services.clone())
    }
}
