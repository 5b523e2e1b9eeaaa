//! The detecting TCP front door.
//!
//! Every accepted socket runs in its own task through
//! detect → snoop → connect → relay. Bytes are buffered until a registered
//! protocol recognises the prefix and has the complete first frame it needs
//! for routing; that phase is bounded by the connection timeout. HTTP clients
//! are then served by the [`HttpProxyHandler`] with the buffered bytes
//! replayed, other protocols are piped to a backend of their virtual host
//! after the (possibly rewritten) prefix was written to it.
use std::{convert::Infallible, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::body::Body as AxumBody;
use bytes::{Bytes, BytesMut};
use eyre::{Result, WrapErr};
use hyper::{Request, Response, StatusCode, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{Instant, timeout, timeout_at},
};
use tracing::Instrument;
use uuid::Uuid;

use super::{PrefixedIo, http_proxy::HttpProxyHandler, relay};
use crate::{
    core::{
        GatewayService, Protocol,
        backend::BackendUrl,
        protocol::{Detection, MAX_SNOOP_BUFFER, ProtocolError, Snooped},
    },
    metrics, tracing_setup,
    utils::{ConnectionGuard, ShutdownToken},
};

/// Why a connection never reached a backend.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("protocol not identified within {0:?}")]
    Timeout(Duration),

    #[error("no registered protocol matches the first {buffered} bytes")]
    NoMatch { buffered: usize },

    #[error("client closed the connection after {buffered} bytes")]
    ClosedEarly { buffered: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no {protocol} backend available for virtual host {virtual_host:?}")]
    NoBackend {
        protocol: &'static str,
        virtual_host: Option<String>,
    },

    #[error("backend {backend} unreachable: {reason}")]
    BackendUnreachable { backend: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Metric label for the failure.
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectionError::Timeout(_) => "timeout",
            ConnectionError::NoMatch { .. } => "no_match",
            ConnectionError::ClosedEarly { .. } => "closed",
            ConnectionError::Protocol(_) => "decode",
            ConnectionError::NoBackend { .. } => "no_backend",
            ConnectionError::BackendUnreachable { .. } => "backend_unreachable",
            ConnectionError::Io(_) => "io",
        }
    }
}

/// Accept loop plus per-connection state machine.
pub struct DetectingGateway {
    gateway: Arc<GatewayService>,
    http_proxy: Arc<HttpProxyHandler>,
}

impl DetectingGateway {
    pub fn new(gateway: Arc<GatewayService>, http_proxy: Arc<HttpProxyHandler>) -> Self {
        Self {
            gateway,
            http_proxy,
        }
    }

    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        TcpListener::bind(listen_addr)
            .await
            .wrap_err_with(|| format!("Failed to bind gateway listener on {listen_addr}"))
    }

    /// Accept connections until shutdown. In-flight connections keep running.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownToken) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to read listener address")?;
        tracing::info!(
            %local_addr,
            protocols = ?self.gateway.registry(),
            "wiregate listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        // usually fd exhaustion; back off instead of spinning
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                reason = shutdown.wait_for_shutdown() => {
                    tracing::info!(?reason, %local_addr, "Gateway listener stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Drive one client connection to completion.
    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let connection_id = Uuid::new_v4().to_string();
        let span = tracing_setup::connection_span(&connection_id, peer);

        async move {
            let mut guard = self.gateway.tracker().register(peer);
            if let Err(e) = self.serve(stream, peer, &mut guard).await {
                guard.fail(e.reason());
                match &e {
                    ConnectionError::Protocol(_) => {
                        tracing::warn!(error = %e, "Protocol error, closing client")
                    }
                    ConnectionError::BackendUnreachable { .. } | ConnectionError::NoBackend { .. } => {
                        tracing::warn!(error = %e, "Closing client")
                    }
                    _ => tracing::debug!(error = %e, "Closing client"),
                }
            }
            guard.close();
        }
        .instrument(span)
        .await
    }

    async fn serve(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        guard: &mut ConnectionGuard,
    ) -> Result<(), ConnectionError> {
        let connection_timeout = self.gateway.tracker().connection_timeout();
        let deadline = Instant::now() + connection_timeout;
        let (protocol, snooped) = self
            .identify(&mut stream, deadline)
            .await
            .map_err(|e| match e {
                IdentifyError::Elapsed => ConnectionError::Timeout(connection_timeout),
                IdentifyError::Connection(e) => e,
            })?;

        tracing::Span::current().record("protocol", protocol.name());
        metrics::increment_protocol_detected(protocol.name());
        tracing::debug!(
            protocol = protocol.name(),
            parameters = ?snooped.parameters,
            "Protocol identified"
        );

        if protocol.is_http() {
            self.serve_http(stream, peer, snooped.buffer, guard).await;
            return Ok(());
        }
        self.serve_tcp(stream, peer, protocol.as_ref(), snooped, guard)
            .await
    }

    /// Buffer the client's first bytes until a protocol matched and produced
    /// its routing parameters. Only reads issued here are bounded by `deadline`.
    async fn identify(
        &self,
        stream: &mut TcpStream,
        deadline: Instant,
    ) -> Result<(Arc<dyn Protocol>, Snooped), IdentifyError> {
        let registry = self.gateway.registry();
        let mut buffer = BytesMut::with_capacity(1024);
        let mut detected: Option<Arc<dyn Protocol>> = None;

        loop {
            let read = timeout_at(deadline, stream.read_buf(&mut buffer))
                .await
                .map_err(|_| IdentifyError::Elapsed)?;
            if read.map_err(ConnectionError::from)? == 0 {
                return Err(ConnectionError::ClosedEarly {
                    buffered: buffer.len(),
                }
                .into());
            }

            let protocol = match &detected {
                Some(protocol) => protocol.clone(),
                None => match registry.detect(&buffer) {
                    Detection::Matched(protocol) => {
                        detected = Some(protocol.clone());
                        protocol
                    }
                    Detection::NeedMoreData => continue,
                    Detection::NoMatch => {
                        return Err(ConnectionError::NoMatch {
                            buffered: buffer.len(),
                        }
                        .into());
                    }
                },
            };

            let prefix = Bytes::copy_from_slice(&buffer);
            match protocol.snoop(&prefix).map_err(ConnectionError::from)? {
                Some(snooped) => return Ok((protocol, snooped)),
                None if buffer.len() >= MAX_SNOOP_BUFFER => {
                    return Err(ConnectionError::from(ProtocolError::FrameTooLarge {
                        protocol: protocol.name(),
                        limit: MAX_SNOOP_BUFFER,
                    })
                    .into());
                }
                None => {}
            }
        }
    }

    /// Hand the connection to the HTTP proxy. The attempt counts as successful
    /// once the connection is handed over; per-request failures are answered
    /// with HTTP status codes.
    async fn serve_http(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        prefix: Bytes,
        guard: &mut ConnectionGuard,
    ) {
        guard.connected(peer.to_string());
        let proxy = self.http_proxy.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            async move {
                let response = match proxy.handle_request(req.map(AxumBody::new), peer).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(error = %e, "HTTP proxy failed");
                        let mut response = Response::new(AxumBody::from("Internal gateway error"));
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        response
                    }
                };
                Ok::<_, Infallible>(response)
            }
        });

        let io = TokioIo::new(PrefixedIo::new(prefix, stream));
        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!(error = %e, "HTTP connection ended with error");
        }
    }

    async fn serve_tcp(
        &self,
        client: TcpStream,
        peer: SocketAddr,
        protocol: &dyn Protocol,
        snooped: Snooped,
        guard: &mut ConnectionGuard,
    ) -> Result<(), ConnectionError> {
        let params = &snooped.parameters;
        let attempts = if self.gateway.retry_next_candidate() { 2 } else { 1 };
        let mut excluded: Vec<String> = Vec::new();
        let mut last_error = None;

        for _ in 0..attempts {
            let backend_url = match self
                .gateway
                .choose_tcp_backend(protocol, params, peer, &excluded)
            {
                Ok(url) => url,
                Err(_) => {
                    return Err(last_error.unwrap_or_else(|| ConnectionError::NoBackend {
                        protocol: protocol.name(),
                        virtual_host: self.gateway.virtual_host_for(params).map(str::to_string),
                    }));
                }
            };

            match self.open_backend(&backend_url, &snooped.buffer).await {
                Ok(backend) => {
                    tracing::Span::current().record("backend", backend_url.as_str());
                    let client_name = match &params.client_id {
                        Some(client_id) => format!("{client_id}@{peer}"),
                        None => peer.to_string(),
                    };
                    guard.connected(client_name);
                    tracing::info!(
                        protocol = protocol.name(),
                        backend = %backend_url,
                        "Relaying connection"
                    );

                    let stats = relay::relay(client, backend).await;
                    tracing::info!(
                        upstream_bytes = stats.upstream,
                        downstream_bytes = stats.downstream,
                        closed_by = ?stats.closed_by,
                        error = stats.error.as_ref().map(tracing::field::display),
                        "Relay finished"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Backend connection failed");
                    excluded.push(backend_url);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(ConnectionError::NoBackend {
            protocol: protocol.name(),
            virtual_host: None,
        }))
    }

    /// Connect to a backend and send it the (rewritten) prefix.
    async fn open_backend(&self, url: &str, prefix: &Bytes) -> Result<TcpStream, ConnectionError> {
        let unreachable = |reason: String| ConnectionError::BackendUnreachable {
            backend: url.to_string(),
            reason,
        };
        let backend_url = BackendUrl::new(url).map_err(|e| unreachable(e.to_string()))?;
        let authority = backend_url.authority();

        let mut stream = timeout(
            self.gateway.backend_connect_timeout(),
            TcpStream::connect(authority.as_str()),
        )
        .await
        .map_err(|_| unreachable("connect timed out".to_string()))?
        .map_err(|e| unreachable(e.to_string()))?;

        let _ = stream.set_nodelay(true);
        stream
            .write_all(prefix)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        Ok(stream)
    }
}

/// Detection failures, keeping the deadline apart so the caller can report
/// the timeout that applied.
enum IdentifyError {
    Elapsed,
    Connection(ConnectionError),
}

impl From<ConnectionError> for IdentifyError {
    fn from(e: ConnectionError) -> Self {
        IdentifyError::Connection(e)
    }
}
