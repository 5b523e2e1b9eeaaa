//! ActiveMQ OpenWire detection.
use bytes::Bytes;

use super::{ConnectionParameters, Protocol, ProtocolError, Snooped};

const WIRE_FORMAT_INFO: u8 = 1;
const MAGIC: &[u8] = b"ActiveMQ";
// 4 byte frame size + 1 byte command type
const MAGIC_OFFSET: usize = 5;

/// OpenWire clients, recognised by the `WireFormatInfo` command they open with.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWireProtocol;

impl Protocol for OpenWireProtocol {
    fn name(&self) -> &'static str {
        "openwire"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["openwire", "tcp"]
    }

    fn max_identification_length(&self) -> usize {
        MAGIC_OFFSET + MAGIC.len()
    }

    fn matches(&self, buffer: &[u8]) -> bool {
        buffer.len() >= self.max_identification_length()
            && buffer[MAGIC_OFFSET - 1] == WIRE_FORMAT_INFO
            && &buffer[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC.len()] == MAGIC
    }

    fn snoop(&self, buffer: &Bytes) -> Result<Option<Snooped>, ProtocolError> {
        Ok(Some(Snooped::unchanged(ConnectionParameters::default(), buffer)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn wire_format_info() -> Vec<u8> {
        let mut frame = vec![0, 0, 1, 0, WIRE_FORMAT_INFO];
        frame.extend_from_slice(MAGIC);
        frame.extend_from_slice(&[0, 0, 0, 12]);
        frame
    }

    #[test]
    fn test_matches_wire_format_info() {
        assert!(OpenWireProtocol.matches(&wire_format_info()));
        assert!(!OpenWireProtocol.matches(&wire_format_info()[..10]));

        let mut other_command = wire_format_info();
        other_command[4] = 2;
        assert!(!OpenWireProtocol.matches(&other_command));
    }
}
