//! Request header codec
//!
//! The first WebSocket exchange carries a binary request header, Base64-encoded in the
//! `Sec-WebSocket-Protocol` field:
//!
//! ```text
//! +---------+-------+--------+----------+---------+------+-------+---------+---------+
//! | Version | Token | AddLen |  Addons  | Command | Port | AType | Address | Payload |
//! +---------+-------+--------+----------+---------+------+-------+---------+---------+
//! |   1B    |  16B  |   1B   | AddLen B |   1B    |  2B  |  1B   |   var   |   var   |
//! +---------+-------+--------+----------+---------+------+-------+---------+---------+
//! ```
//!
//! All integers are big-endian. The reply preamble is [`RESPONSE_HEADER`].
//!
//! Parsing is total: every input, however short or hostile, yields either a
//! [`ParsedRequest`] or a [`HeaderError`]. No read ever goes past the buffer.

use thiserror::Error;

use crate::security::{AccessToken, TOKEN_LEN};

/// Only protocol version accepted
pub const VERSION: u8 = 0;

/// Version 0, no addons; prepended to the first downlink message
pub const RESPONSE_HEADER: [u8; 2] = [VERSION, 0];

/// Shortest buffer that can hold a complete header
pub const MIN_HEADER_LEN: usize = 22;

const TOKEN_OFFSET: usize = 1;
const ADDONS_LEN_OFFSET: usize = TOKEN_OFFSET + TOKEN_LEN;

pub mod address_type {
    pub const IPV4: u8 = 1;
    pub const DOMAIN: u8 = 2;
    pub const IPV6: u8 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
}

impl Command {
    const TCP: u8 = 1;

    /// UDP (2) and mux (3) are known codes but not served
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            Self::TCP => Some(Self::Tcp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("malformed request header")]
    Malformed,
    #[error("access token mismatch")]
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub command: Command,
    pub port: u16,
    pub host: String,
    /// Offset of the first byte after the address field
    pub payload_offset: usize,
}

impl ParsedRequest {
    /// Bytes that trailed the header in `buf`; possibly empty
    #[must_use]
    pub fn initial_payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.payload_offset..).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub host: String,
    /// Offset of the first byte past the address field
    pub end: usize,
}

/// Decodes and validates a request header
pub fn parse_request(buf: &[u8], token: &AccessToken) -> Result<ParsedRequest, HeaderError> {
    if buf.len() < MIN_HEADER_LEN || buf[0] != VERSION {
        return Err(HeaderError::Malformed);
    }
    if !token.matches(&buf[TOKEN_OFFSET..ADDONS_LEN_OFFSET]) {
        return Err(HeaderError::Unauthorized);
    }

    let addons_len = usize::from(buf[ADDONS_LEN_OFFSET]);
    let command_offset = ADDONS_LEN_OFFSET + 1 + addons_len;

    // command + port
    let Some(&[command, port_hi, port_lo]) = buf.get(command_offset..command_offset + 3) else {
        return Err(HeaderError::Malformed);
    };
    let command = Command::from_byte(command).ok_or(HeaderError::Malformed)?;
    let port = u16::from_be_bytes([port_hi, port_lo]);

    let address = decode_address(buf, command_offset + 3).ok_or(HeaderError::Malformed)?;

    Ok(ParsedRequest {
        command,
        port,
        host: address.host,
        payload_offset: address.end,
    })
}

/// Decodes the address whose type byte sits at `offset`
#[must_use]
pub fn decode_address(buf: &[u8], offset: usize) -> Option<ParsedAddress> {
    let atype = *buf.get(offset)?;
    let value = offset + 1;

    match atype {
        address_type::IPV4 => {
            let end = value + 4;
            let octets = buf.get(value..end)?;
            let host = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
            Some(ParsedAddress { host, end })
        }
        address_type::DOMAIN => {
            let len = usize::from(*buf.get(value)?);
            let end = value + 1 + len;
            let name = buf.get(value + 1..end)?;
            let host = String::from_utf8_lossy(name).into_owned();
            Some(ParsedAddress { host, end })
        }
        address_type::IPV6 => {
            let end = value + 16;
            let bytes = buf.get(value..end)?;
            let host = bytes
                .chunks_exact(2)
                .map(|group| format!("{:x}", u16::from_be_bytes([group[0], group[1]])))
                .collect::<Vec<_>>()
                .join(":");
            Some(ParsedAddress { host, end })
        }
        _ => None,
    }
}
