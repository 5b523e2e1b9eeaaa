//! wiregate - a protocol-detecting TCP gateway.
//!
//! wiregate listens on a single port and works out which protocol a client
//! speaks from its first bytes (HTTP, MQTT, STOMP, AMQP or OpenWire). HTTP
//! requests are reverse-proxied through URI-template mapping rules; every other
//! protocol is relayed byte for byte to a backend of the client's virtual host.
//! Backends come from a discovery source that is polled periodically, and each
//! mapping picks its backend with a random, round-robin or sticky load balancer.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use wiregate::{
//!     DetectingGateway, GatewayService, HttpProxyHandler, adapters::HttpClientAdapter,
//!     utils::GracefulShutdown,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = wiregate::config::load_config("wiregate.toml").await?;
//! let gateway = Arc::new(GatewayService::new(&config)?);
//! let proxy = Arc::new(HttpProxyHandler::from_config(
//!     gateway.clone(),
//!     Arc::new(HttpClientAdapter::new()?),
//!     &config.http,
//! )?);
//! let shutdown = GracefulShutdown::new();
//! let listener = DetectingGateway::bind(&config.listen_addr).await?;
//! Arc::new(DetectingGateway::new(gateway, proxy))
//!     .run(listener, shutdown.shutdown_token())
//!     .await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Routing state and protocol codecs live in `core` and perform no I/O.
//! `ports` declares the traits the core needs from the outside world
//! (discovery sources, the backend HTTP client) and `adapters` implements
//! them together with the socket-facing pieces: the detecting acceptor, the
//! byte relay, the HTTP proxy, the discovery poller and the admin API.
//!
//! # Error Handling
//! Domain failures are `thiserror` enums; application plumbing returns
//! `eyre::Result` with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Routing tables are `scc::HashMap`s whose values are replaced copy-on-write,
//! so readers never wait on a table-wide lock.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{DetectingGateway, DiscoveryPoller, HttpClientAdapter, HttpProxyHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::{ConnectionTracker, GracefulShutdown},
};
