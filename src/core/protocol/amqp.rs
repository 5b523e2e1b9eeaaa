//! AMQP protocol header detection.
//!
//! Only the 8-byte protocol header is inspected. The virtual host travels in
//! the AMQP `open` performative, which needs a full frame codec, so AMQP
//! connections are routed with the default virtual host.
use bytes::Bytes;

use super::{ConnectionParameters, Protocol, ProtocolError, Snooped};

const HEADER_LEN: usize = 8;

/// AMQP 1.0 (plain, TLS and SASL layers) and AMQP 0-9-1 clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpProtocol;

impl Protocol for AmqpProtocol {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["amqp", "amqps", "tcp"]
    }

    fn max_identification_length(&self) -> usize {
        HEADER_LEN
    }

    fn matches(&self, buffer: &[u8]) -> bool {
        let Some(header) = buffer.get(..HEADER_LEN) else {
            return false;
        };
        if &header[..4] != b"AMQP" {
            return false;
        }
        match header[4..] {
            // 1.0.0 with protocol id 0 (AMQP), 2 (TLS) or 3 (SASL)
            [0 | 2 | 3, 1, 0, 0] => true,
            // 0-9-1
            [0, 0, 9, 1] => true,
            _ => false,
        }
    }

    fn snoop(&self, buffer: &Bytes) -> Result<Option<Snooped>, ProtocolError> {
        Ok(Some(Snooped::unchanged(ConnectionParameters::default(), buffer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_amqp_headers() {
        assert!(AmqpProtocol.matches(b"AMQP\x00\x01\x00\x00"));
        assert!(AmqpProtocol.matches(b"AMQP\x03\x01\x00\x00\x00\x00"));
        assert!(AmqpProtocol.matches(b"AMQP\x00\x00\x09\x01"));
        assert!(!AmqpProtocol.matches(b"AMQP\x00\x01\x00"));
        assert!(!AmqpProtocol.matches(b"AMQP\x07\x01\x00\x00"));
        assert!(!AmqpProtocol.matches(b"AMQX\x00\x01\x00\x00"));
    }

    #[test]
    fn test_snoop_keeps_header() {
        let header = Bytes::from_static(b"AMQP\x00\x01\x00\x00");
        let snooped = AmqpProtocol.snoop(&header).unwrap().unwrap();
        assert_eq!(snooped.parameters, ConnectionParameters::default());
        assert_eq!(snooped.buffer, header);
    }
}
