use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Failures forwarding a request to a backend.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The backend could not be reached or dropped the exchange
    #[error("Backend connection failed: {0}")]
    ConnectionError(String),

    /// The request could not be sent as built
    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Outbound side of the HTTP proxy.
///
/// The request URI already names the chosen backend; implementations forward
/// method, headers and body as they are.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
