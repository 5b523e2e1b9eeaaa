pub mod acceptor;
pub mod admin;
pub mod discovery;
pub mod http_client;
pub mod http_proxy;
pub mod prefixed_io;
pub mod relay;

/// Re-export commonly used types from adapters
pub use acceptor::{ConnectionError, DetectingGateway};
pub use admin::{admin_router, serve_admin};
pub use discovery::{DiscoveryPoller, FileDiscovery, HttpDiscovery, StaticDiscovery};
pub use http_client::HttpClientAdapter;
pub use http_proxy::HttpProxyHandler;
pub use prefixed_io::PrefixedIo;
pub use relay::{RelaySide, RelayStats, relay};
