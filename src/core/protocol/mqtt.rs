//! MQTT CONNECT detection and virtual-host extraction.
//!
//! Clients select a virtual host by prefixing their user name, `vhost/user`.
//! The prefix is stripped before the CONNECT packet reaches the broker, and the
//! packet's remaining-length field is re-encoded to match the shorter payload.
use bytes::{BufMut, Bytes, BytesMut};

use super::{ConnectionParameters, MAX_SNOOP_BUFFER, Protocol, ProtocolError, Snooped};

const NAME: &str = "mqtt";
const CONNECT_HEADER: u8 = 0x10;
const MAX_VARINT_BYTES: usize = 4;

const FLAG_WILL: u8 = 0x04;
const FLAG_USERNAME: u8 = 0x80;

const LEVEL_V5: u8 = 5;

/// MQTT 3.1, 3.1.1 and 5.0 clients.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttProtocol;

impl Protocol for MqttProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["mqtt", "tcp"]
    }

    fn max_identification_length(&self) -> usize {
        // fixed header byte + 4 length bytes + name length + "MQIsdp"
        1 + MAX_VARINT_BYTES + 2 + 6
    }

    fn matches(&self, buffer: &[u8]) -> bool {
        if buffer.first() != Some(&CONNECT_HEADER) {
            return false;
        }
        let Ok(Some((_, length_bytes))) = decode_varint(&buffer[1..]) else {
            return false;
        };
        let name_at = 1 + length_bytes;
        let Some(len) = buffer.get(name_at..name_at + 2) else {
            return false;
        };
        let name_len = u16::from_be_bytes([len[0], len[1]]) as usize;
        match buffer.get(name_at + 2..name_at + 2 + name_len) {
            Some(name) => name == b"MQTT" || name == b"MQIsdp",
            None => false,
        }
    }

    fn snoop(&self, buffer: &Bytes) -> Result<Option<Snooped>, ProtocolError> {
        let (remaining, length_bytes) = match decode_varint(&buffer[1..]) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(None),
            Err(reason) => return Err(ProtocolError::malformed(NAME, reason)),
        };
        let body_start = 1 + length_bytes;
        let total = body_start + remaining;
        if total > MAX_SNOOP_BUFFER {
            return Err(ProtocolError::FrameTooLarge {
                protocol: NAME,
                limit: MAX_SNOOP_BUFFER,
            });
        }
        if buffer.len() < total {
            return Ok(None);
        }

        let connect = parse_connect(&buffer[body_start..total])?;
        let mut parameters = ConnectionParameters {
            client_id: Some(connect.client_id).filter(|id| !id.is_empty()),
            user: None,
            virtual_host: None,
        };

        let Some(username) = connect.username else {
            return Ok(Some(Snooped::unchanged(parameters, buffer)));
        };

        match username.value.split_once('/') {
            Some((virtual_host, user)) if !virtual_host.is_empty() => {
                parameters.virtual_host = Some(virtual_host.to_string());
                parameters.user = Some(user.to_string());

                let body = &buffer[body_start..total];
                let rewritten = rewrite_username(body, username.start, username.end, user);
                let mut out = BytesMut::with_capacity(buffer.len());
                out.put_u8(CONNECT_HEADER);
                out.put_slice(&encode_varint(rewritten.len()));
                out.put_slice(&rewritten);
                // bytes the client pipelined behind CONNECT
                out.put_slice(&buffer[total..]);

                tracing::debug!(
                    virtual_host = %virtual_host,
                    original_length = remaining,
                    rewritten_length = rewritten.len(),
                    "Stripped virtual host from MQTT user name"
                );
                Ok(Some(Snooped {
                    parameters,
                    buffer: out.freeze(),
                }))
            }
            _ => {
                parameters.user = Some(username.value.clone());
                Ok(Some(Snooped::unchanged(parameters, buffer)))
            }
        }
    }
}

/// Position of the user name field inside the CONNECT body.
struct UsernameField {
    value: String,
    start: usize,
    end: usize,
}

struct Connect {
    client_id: String,
    username: Option<UsernameField>,
}

fn parse_connect(body: &[u8]) -> Result<Connect, ProtocolError> {
    let mut reader = Reader::new(body);
    reader.string()?;
    let level = reader.u8()?;
    let flags = reader.u8()?;
    reader.u16()?;
    if level == LEVEL_V5 {
        reader.skip_properties()?;
    }

    let client_id = reader.string()?;

    if flags & FLAG_WILL != 0 {
        if level == LEVEL_V5 {
            reader.skip_properties()?;
        }
        reader.string()?;
        reader.binary()?;
    }

    let username = if flags & FLAG_USERNAME != 0 {
        let start = reader.pos;
        let value = reader.string()?;
        Some(UsernameField {
            value,
            start,
            end: reader.pos,
        })
    } else {
        None
    };

    Ok(Connect {
        client_id,
        username,
    })
}

fn rewrite_username(body: &[u8], start: usize, end: usize, user: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    out.extend_from_slice(&body[..start]);
    out.extend_from_slice(&(user.len() as u16).to_be_bytes());
    out.extend_from_slice(user.as_bytes());
    out.extend_from_slice(&body[end..]);
    out
}

/// Decode an MQTT variable byte integer. `Ok(None)` means more bytes are needed.
fn decode_varint(buffer: &[u8]) -> Result<Option<(usize, usize)>, &'static str> {
    let mut value = 0usize;
    for (index, byte) in buffer.iter().enumerate() {
        if index == MAX_VARINT_BYTES {
            return Err("variable byte integer longer than 4 bytes");
        }
        value |= ((byte & 0x7f) as usize) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if buffer.len() >= MAX_VARINT_BYTES {
        Err("variable byte integer longer than 4 bytes")
    } else {
        Ok(None)
    }
}

fn encode_varint(mut value: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_BYTES);
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return out;
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| ProtocolError::malformed(NAME, "CONNECT packet truncated"))?;
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn binary(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.binary()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::malformed(NAME, "string field is not UTF-8"))
    }

    fn skip_properties(&mut self) -> Result<(), ProtocolError> {
        let (len, used) = decode_varint(&self.buf[self.pos..])
            .map_err(|reason| ProtocolError::malformed(NAME, reason))?
            .ok_or_else(|| ProtocolError::malformed(NAME, "property length truncated"))?;
        self.pos += used;
        self.take(len)?;
        Ok(())
    }
}
