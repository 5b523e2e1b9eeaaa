pub mod discovery;
pub mod http_client;

pub use discovery::{DiscoveryError, DiscoverySource, ServiceDescriptor};
pub use http_client::{HttpClient, HttpClientError};
