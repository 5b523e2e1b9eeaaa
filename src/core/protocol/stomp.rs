//! STOMP CONNECT / STOMP frame detection.
use bytes::Bytes;

use super::{ConnectionParameters, MAX_SNOOP_BUFFER, Protocol, ProtocolError, Snooped};

const NAME: &str = "stomp";
const COMMANDS: &[&[u8]] = &[b"CONNECT", b"STOMP"];

/// STOMP 1.0 - 1.2 clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct StompProtocol;

impl Protocol for StompProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["stomp", "tcp"]
    }

    fn max_identification_length(&self) -> usize {
        // "CONNECT\r\n"
        9
    }

    fn matches(&self, buffer: &[u8]) -> bool {
        COMMANDS.iter().any(|command| {
            buffer.starts_with(command) && {
                let rest = &buffer[command.len()..];
                rest.starts_with(b"\n") || rest.starts_with(b"\r\n")
            }
        })
    }

    fn snoop(&self, buffer: &Bytes) -> Result<Option<Snooped>, ProtocolError> {
        let Some(head_end) = find_headers_end(buffer) else {
            if buffer.len() > MAX_SNOOP_BUFFER {
                return Err(ProtocolError::FrameTooLarge {
                    protocol: NAME,
                    limit: MAX_SNOOP_BUFFER,
                });
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&buffer[..head_end])
            .map_err(|_| ProtocolError::malformed(NAME, "frame headers are not UTF-8"))?;

        let mut parameters = ConnectionParameters::default();
        for line in head.lines().skip(1) {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::malformed(NAME, format!("invalid header '{line}'")))?;
            // repeated headers: the first occurrence wins
            let slot = match name {
                "host" => &mut parameters.virtual_host,
                "login" => &mut parameters.user,
                "client-id" => &mut parameters.client_id,
                _ => continue,
            };
            if slot.is_none() && !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }

        Ok(Some(Snooped::unchanged(parameters, buffer)))
    }
}

fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(2)
        .position(|window| window == b"\n\n")
        .into_iter()
        .chain(buffer.windows(4).position(|window| window == b"\r\n\r\n"))
        .min()
}
