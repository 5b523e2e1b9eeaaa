use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    config::loader::load_file,
    ports::discovery::{DiscoveryError, DiscoveryResult, DiscoverySource, ServiceDescriptor},
};

#[derive(Debug, Deserialize)]
struct ServicesFile {
    #[serde(default)]
    services: Vec<ServiceDescriptor>,
}

/// A services file (YAML, JSON, TOML or INI by extension) re-read on every poll.
///
/// ```yaml
/// services:
///   - name: crm
///     labels: { version: "1.0" }
///     urls: ["http://10.0.0.5:8183/cxf/crm"]
/// ```
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DiscoverySource for FileDiscovery {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn services(&self) -> DiscoveryResult<Vec<ServiceDescriptor>> {
        let path = self.path.clone();
        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if !exists {
            return Err(DiscoveryError::Unavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let file = tokio::task::spawn_blocking(move || load_file::<ServicesFile>(&path))
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?
            .map_err(|e| DiscoveryError::InvalidPayload(format!("{e:#}")))?;
        Ok(file.services)
    }
}
