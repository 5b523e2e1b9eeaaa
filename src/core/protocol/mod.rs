//! Protocol plug-ins and the detector that picks one for an inbound stream.
//!
//! A [`Protocol`] knows how to recognise its own preamble from a prefix of the
//! byte stream and how to pull routing hints ([`ConnectionParameters`]) out of
//! the first frame once it is fully buffered. The [`ProtocolRegistry`] owns the
//! set of known protocols and tests them in registration order, so the first
//! protocol whose signature matches wins an ambiguous prefix.
use std::{fmt, sync::Arc};

use bytes::Bytes;
use thiserror::Error;

pub mod amqp;
pub mod http;
pub mod mqtt;
pub mod openwire;
pub mod stomp;

pub use amqp::AmqpProtocol;
pub use http::HttpProtocol;
pub use mqtt::MqttProtocol;
pub use openwire::OpenWireProtocol;
pub use stomp::StompProtocol;

/// Upper bound on the bytes buffered while waiting for a complete first frame.
pub const MAX_SNOOP_BUFFER: usize = 64 * 1024;

/// Errors raised while decoding the frame a protocol claimed to match.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The frame is structurally invalid
    #[error("{protocol}: malformed frame: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },

    /// The frame grew beyond the snoop buffer limit
    #[error("{protocol}: first frame exceeds {limit} bytes")]
    FrameTooLarge { protocol: &'static str, limit: usize },
}

impl ProtocolError {
    pub(crate) fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Routing hints extracted from the first frame of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub client_id: Option<String>,
    pub user: Option<String>,
    pub virtual_host: Option<String>,
}

/// Result of a successful snoop: the extracted parameters and the bytes that
/// must be forwarded to the backend in place of the original prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snooped {
    pub parameters: ConnectionParameters,
    pub buffer: Bytes,
}

impl Snooped {
    /// Parameters with the buffer forwarded untouched.
    pub fn unchanged(parameters: ConnectionParameters, buffer: &Bytes) -> Self {
        Self {
            parameters,
            buffer: buffer.clone(),
        }
    }
}

/// A wire protocol the gateway can recognise.
pub trait Protocol: Send + Sync + 'static {
    /// Human readable protocol name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// URI schemes of backends able to serve this protocol.
    fn schemes(&self) -> &'static [&'static str];

    /// Number of bytes after which a non-matching prefix can never match.
    fn max_identification_length(&self) -> usize;

    /// Whether the buffered prefix carries this protocol's signature.
    fn matches(&self, buffer: &[u8]) -> bool;

    /// Extract connection parameters from the buffered prefix.
    ///
    /// Returns `Ok(None)` while the frame needed for extraction is incomplete.
    fn snoop(&self, buffer: &Bytes) -> Result<Option<Snooped>, ProtocolError>;

    /// Whether connections of this protocol are served by the HTTP proxy.
    fn is_http(&self) -> bool {
        false
    }

    /// Whether a backend URL with the given scheme can serve this protocol.
    fn serves_scheme(&self, scheme: &str) -> bool {
        self.schemes()
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(scheme))
    }
}

/// Outcome of testing a buffered prefix against the registry.
#[derive(Clone)]
pub enum Detection {
    Matched(Arc<dyn Protocol>),
    NeedMoreData,
    NoMatch,
}

impl fmt::Debug for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detection::Matched(protocol) => write!(f, "Matched({})", protocol.name()),
            Detection::NeedMoreData => write!(f, "NeedMoreData"),
            Detection::NoMatch => write!(f, "NoMatch"),
        }
    }
}

/// Ordered set of known protocols.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
    max_identification_length: usize,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in protocol, HTTP first.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpProtocol));
        registry.register(Arc::new(MqttProtocol));
        registry.register(Arc::new(StompProtocol));
        registry.register(Arc::new(AmqpProtocol));
        registry.register(Arc::new(OpenWireProtocol));
        registry
    }

    /// Append a protocol. Earlier registrations win ambiguous prefixes.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) {
        self.max_identification_length = self
            .max_identification_length
            .max(protocol.max_identification_length());
        tracing::debug!(protocol = protocol.name(), "Registered protocol");
        self.protocols.push(protocol);
    }

    /// Look up a registered protocol by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols
            .iter()
            .find(|protocol| protocol.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn protocols(&self) -> &[Arc<dyn Protocol>] {
        &self.protocols
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Longest prefix any registered protocol needs for identification.
    pub fn max_identification_length(&self) -> usize {
        self.max_identification_length
    }

    /// Test the accumulated prefix against every protocol in registration order.
    pub fn detect(&self, buffer: &[u8]) -> Detection {
        if let Some(protocol) = self
            .protocols
            .iter()
            .find(|protocol| protocol.matches(buffer))
        {
            return Detection::Matched(protocol.clone());
        }

        if buffer.len() >= self.max_identification_length {
            Detection::NoMatch
        } else {
            Detection::NeedMoreData
        }
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.protocols.iter().map(|protocol| protocol.name()))
            .finish()
    }
}
