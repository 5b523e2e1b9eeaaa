//! HTTP/1.x request-line detection.
use bytes::Bytes;

use super::{ConnectionParameters, Protocol, ProtocolError, Snooped};

const METHODS: &[&[u8]] = &[
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"TRACE ",
    b"CONNECT ",
];

/// Plain HTTP/1.x, recognised by its request method token.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProtocol;

impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["http", "https"]
    }

    fn max_identification_length(&self) -> usize {
        METHODS.iter().map(|method| method.len()).max().unwrap_or(0)
    }

    fn matches(&self, buffer: &[u8]) -> bool {
        METHODS.iter().any(|method| buffer.starts_with(method))
    }

    /// Requests are routed one by one by the HTTP proxy, so only the `Host`
    /// header is picked up here (when it is already buffered) for logging.
    fn snoop(&self, buffer: &Bytes) -> Result<Option<Snooped>, ProtocolError> {
        let virtual_host = host_header(buffer);
        Ok(Some(Snooped::unchanged(
            ConnectionParameters {
                virtual_host,
                ..Default::default()
            },
            buffer,
        )))
    }

    fn is_http(&self) -> bool {
        true
    }
}

fn host_header(buffer: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(buffer);
    let head = text.split("\r\n\r\n").next().unwrap_or_default();
    head.split("\r\n").skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("host") {
            let host = value.trim();
            let host = host.split(':').next().unwrap_or(host);
            (!host.is_empty()).then(|| host.to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_known_methods() {
        assert!(HttpProtocol.matches(b"GET / HTTP/1.1\r\n"));
        assert!(HttpProtocol.matches(b"OPTIONS * HTTP/1.1\r\n"));
        assert!(!HttpProtocol.matches(b"GETX / HTTP/1.1\r\n"));
        assert!(!HttpProtocol.matches(b"CONNECT\n"));
    }

    #[test]
    fn test_snoop_extracts_host() {
        let buffer = Bytes::from_static(b"GET / HTTP/1.1\r\nHost: shop.example.com:8080\r\n\r\n");
        let snooped = HttpProtocol.snoop(&buffer).unwrap().unwrap();
        assert_eq!(
            snooped.parameters.virtual_host.as_deref(),
            Some("shop.example.com")
        );
        assert_eq!(snooped.buffer, buffer);
    }

    #[test]
    fn test_snoop_without_host_header() {
        let buffer = Bytes::from_static(b"GET / HTTP/1.0\r\n");
        let snooped = HttpProtocol.snoop(&buffer).unwrap().unwrap();
        assert_eq!(snooped.parameters, ConnectionParameters::default());
    }
}
