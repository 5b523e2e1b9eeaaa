use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

/// Backend HTTP client on Hyper with Rustls.
///
/// Requests are forwarded as received: method, headers and body are untouched.
/// The client's `Host` header is kept so backends see the name the client
/// used; it is only filled in from the target URI when missing.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // ignore the error when a provider was already installed
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                errors = ?native_certs.errors,
                "Some native certificates failed to load"
            );
        }
        tracing::debug!(roots = root_cert_store.len(), "Loaded native root certificates");

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let Some(host) = req.uri().host() else {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        };
        let authority = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        if !parts.headers.contains_key(header::HOST) {
            let value = HeaderValue::from_str(&authority)
                .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
            parts.headers.insert(header::HOST, value);
        }

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        tracing::debug!(%method, %uri, "Sending backend request");

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                // the gateway re-frames the streamed body
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => Err(HttpClientError::ConnectionError(format!(
                "Request to {method} {uri} failed: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, http::HeaderMap, routing::get};
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[tokio::test]
    async fn test_relative_uri_is_rejected() {
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri("/no-host")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_host_header_is_preserved() {
        let app = Router::new().route(
            "/echo-host",
            get(|headers: HeaderMap| async move {
                headers
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/echo-host"))
            .header(header::HOST, "gateway-host:80")
            .body(AxumBody::empty())
            .unwrap();
        let response = client.send_request(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "gateway-host:80");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            client.send_request(req).await,
            Err(HttpClientError::ConnectionError(_))
        ));
    }
}
