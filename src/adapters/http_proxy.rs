//! Reverse proxy for HTTP connections.
//!
//! Requests are routed to the longest mapped path prefix, forwarded to a
//! backend chosen by that mapping's load balancer, and answered with backend
//! URLs in `Location`, `Content-Location` and `URI` rewritten to the gateway.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body as AxumBody,
    http::{HeaderName, HeaderValue, StatusCode, header},
};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};
use tracing::Instrument;

use crate::{
    config::HttpConfig,
    core::GatewayService,
    metrics::{self, RequestTimer},
    ports::http_client::HttpClient,
    tracing_setup,
};

/// Response headers carrying backend URLs that are mapped back to the gateway.
const REVERSE_HEADERS: [HeaderName; 3] = [
    header::LOCATION,
    header::CONTENT_LOCATION,
    HeaderName::from_static("uri"),
];

/// Reverse proxy for HTTP connections handed over by the detecting gateway.
///
/// The longest resolved path of any mapping rule selects the service; the
/// rest of the request path is appended to the chosen backend URL.
#[derive(Clone)]
pub struct HttpProxyHandler {
    gateway: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
    external_url: Option<String>,
    show_mapping_index: bool,
    request_timeout: Duration,
}

impl HttpProxyHandler {
    pub fn new(gateway: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            gateway,
            http_client,
            external_url: None,
            show_mapping_index: false,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        gateway: Arc<GatewayService>,
        http_client: Arc<dyn HttpClient>,
        config: &HttpConfig,
    ) -> Result<Self> {
        Ok(Self::new(gateway, http_client)
            .with_external_url(config.external_url.clone())
            .with_mapping_index(config.show_mapping_index)
            .with_request_timeout(config.request_timeout()?))
    }

    /// Base URL clients use to reach the gateway, e.g. `http://gateway:80`.
    /// Without it the request's `Host` header is used.
    pub fn with_external_url(mut self, external_url: Option<String>) -> Self {
        self.external_url = external_url
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());
        self
    }

    /// Answer unmapped paths with a JSON index of the mapping table.
    pub fn with_mapping_index(mut self, enabled: bool) -> Self {
        self.show_mapping_index = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Route one request to a backend and relay its response.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: SocketAddr,
    ) -> Result<Response<AxumBody>> {
        let span = tracing_setup::request_span(req.method().as_str(), req.uri().path());
        let timer = RequestTimer::new();
        let result = self.proxy_request(req, client_addr).instrument(span.clone()).await;

        let status = match &result {
            Ok(response) => response.status(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        span.record("http.status_code", status.as_u16());
        metrics::increment_http_requests(status.as_u16());
        tracing::debug!(
            parent: &span,
            status = status.as_u16(),
            elapsed_ms = timer.elapsed().as_millis() as u64,
            "HTTP request completed"
        );
        result
    }

    async fn proxy_request(
        &self,
        mut req: Request<AxumBody>,
        client_addr: SocketAddr,
    ) -> Result<Response<AxumBody>> {
        let path = req.uri().path().to_string();
        let Some((prefix, services)) = self.gateway.find_http_mapping(&path) else {
            tracing::debug!(%path, "No HTTP mapping matches");
            return self.not_found(&path);
        };

        let request_key = client_addr.ip().to_string();
        let backend = match services.choose(&request_key) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(%prefix, error = %e, "No backend for mapped path");
                return plain_response(StatusCode::SERVICE_UNAVAILABLE, "No backend available");
            }
        };
        tracing::Span::current().record("backend", backend.as_str());

        let backend_base = backend.trim_end_matches('/');
        let target = backend_target(backend_base, &prefix, &path, req.uri().query());
        let gateway_base = self.gateway_base(&req);
        *req.uri_mut() = target
            .parse()
            .wrap_err_with(|| format!("Invalid backend URI '{target}'"))?;

        tracing::debug!(%prefix, %target, "Forwarding request");
        let mut response =
            match tokio::time::timeout(self.request_timeout, self.http_client.send_request(req))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::error!(backend = %backend, error = %e, "Backend request failed");
                    return plain_response(StatusCode::BAD_GATEWAY, "Backend request failed");
                }
                Err(_) => {
                    tracing::error!(
                        backend = %backend,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "Backend request timed out"
                    );
                    return plain_response(StatusCode::GATEWAY_TIMEOUT, "Backend request timed out");
                }
            };

        #[allow(clippy::collapsible_if)]
        if services.reverse_headers() {
            if let Some(gateway_base) = gateway_base {
                let public_prefix = format!("{gateway_base}{}", prefix.trim_end_matches('/'));
                rewrite_reverse_headers(&mut response, backend_base, &public_prefix);
            }
        }
        Ok(response)
    }

    fn gateway_base(&self, req: &Request<AxumBody>) -> Option<String> {
        if let Some(external) = &self.external_url {
            return Some(external.clone());
        }
        req.headers()
            .get(header::HOST)
            .and_then(|host| host.to_str().ok())
            .filter(|host| !host.is_empty())
            .map(|host| format!("http://{host}"))
    }

    fn not_found(&self, path: &str) -> Result<Response<AxumBody>> {
        if !self.show_mapping_index {
            return plain_response(StatusCode::NOT_FOUND, &format!("No mapping for {path}"));
        }
        let index = serde_json::to_string_pretty(&self.gateway.mappings_snapshot())
            .wrap_err("Failed to serialize mapping index")?;
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::CONTENT_TYPE, "application/json")
            .body(AxumBody::from(index))
            .wrap_err("Failed to build mapping index response")
    }
}

fn plain_response(status: StatusCode, message: &str) -> Result<Response<AxumBody>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(AxumBody::from(message.to_string()))
        .wrap_err_with(|| format!("Failed to build {status} response"))
}

/// Backend URL for a request: the backend base followed by whatever the
/// request path has beyond the matched prefix.
fn backend_target(backend_base: &str, prefix: &str, path: &str, query: Option<&str>) -> String {
    let mut target = backend_base.to_string();
    // a path equal to the prefix minus its trailing slash maps to the base itself
    if let Some(rest) = path.strip_prefix(prefix.trim_end_matches('/')) {
        target.push_str(rest);
    }
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn rewrite_reverse_headers(
    response: &mut Response<AxumBody>,
    backend_base: &str,
    public_prefix: &str,
) {
    let headers = response.headers_mut();
    for name in REVERSE_HEADERS.iter() {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let Some(rewritten) = reverse_url(value, backend_base, public_prefix) else {
            continue;
        };
        match HeaderValue::from_str(&rewritten) {
            Ok(value) => {
                tracing::trace!(header = %name, %rewritten, "Rewrote response header");
                headers.insert(name.clone(), value);
            }
            Err(e) => tracing::warn!(header = %name, error = %e, "Cannot rewrite header"),
        }
    }
}

/// Map a URL pointing into the backend onto the gateway, the way Apache's
/// `ProxyPassReverse` does. Returns `None` for URLs outside the backend.
fn reverse_url(value: &str, backend_base: &str, public_prefix: &str) -> Option<String> {
    let rest = value.strip_prefix(backend_base)?;
    if !(rest.is_empty() || rest.starts_with(['/', '?', '#'])) {
        return None;
    }
    Some(format!("{public_prefix}{rest}"))
}
