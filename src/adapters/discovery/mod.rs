//! Discovery sources and the poller applying their results.
pub mod file;
pub mod http;
pub mod poller;
pub mod static_source;

pub use file::FileDiscovery;
pub use http::HttpDiscovery;
pub use poller::DiscoveryPoller;
pub use static_source::StaticDiscovery;
