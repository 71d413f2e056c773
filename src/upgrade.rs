//! HTTP/1.1 upgrade handshake.
//!
//! The request head is read and answered by hand rather than through tungstenite's
//! acceptor, because the reply status depends on work done before the switch:
//! header authentication and the outbound dial.

use anyhow::{Context, Result, bail};
use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use std::fmt::Write as _;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{handshake::derive_accept_key, http::StatusCode};

use crate::dialer::DialError;
use crate::protocol::HeaderError;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 1024;

/// URL-safe alphabet, padding optional
const EARLY_DATA: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// The parts of an upgrade request the tunnel cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub upgrade: Option<String>,
    pub websocket_key: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub forwarded_for: Option<String>,
}

impl UpgradeRequest {
    fn from_parsed(request: &httparse::Request<'_, '_>) -> Self {
        let mut parsed = Self::default();
        for header in request.headers.iter() {
            let value = String::from_utf8_lossy(header.value).trim().to_string();
            let slot = match header.name.to_ascii_lowercase().as_str() {
                "upgrade" => &mut parsed.upgrade,
                "sec-websocket-key" => &mut parsed.websocket_key,
                "sec-websocket-protocol" => &mut parsed.protocol,
                "host" => &mut parsed.host,
                "x-forwarded-for" => &mut parsed.forwarded_for,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        parsed
    }

    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        self.upgrade
            .as_deref()
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
    }

    /// The Base64 text carrying the request header, if any
    #[must_use]
    pub fn encoded_header(&self) -> Option<&str> {
        self.protocol.as_deref().filter(|value| !value.is_empty())
    }
}

/// Reasons a connection is refused before the WebSocket switch
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("request is not a WebSocket upgrade")]
    NotUpgrade,
    #[error("missing Sec-WebSocket-Key")]
    MissingKey,
    #[error("missing request header field")]
    MissingHeader,
    #[error("request header field is not valid Base64")]
    Undecodable,
    #[error("malformed request header")]
    Malformed,
    #[error("access token mismatch")]
    Unauthorized,
    #[error("direct and fallback dials failed: {0}")]
    Unreachable(#[from] DialError),
}

impl From<HeaderError> for Rejection {
    fn from(error: HeaderError) -> Self {
        match error {
            HeaderError::Malformed => Self::Malformed,
            HeaderError::Unauthorized => Self::Unauthorized,
        }
    }
}

impl Rejection {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotUpgrade => StatusCode::UPGRADE_REQUIRED,
            Self::MissingKey | Self::MissingHeader | Self::Undecodable | Self::Malformed => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::Unreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Decodes the request header text; `None` when it is not Base64 or decodes to nothing
#[must_use]
pub fn decode_early_data(encoded: &str) -> Option<Vec<u8>> {
    let normalized = encoded.replace('+', "-").replace('/', "_");
    EARLY_DATA
        .decode(normalized)
        .ok()
        .filter(|data| !data.is_empty())
}

/// Reads one request head of at most `limit` bytes. Returns the request and any
/// bytes that arrived after the head.
pub async fn read_request_head<S>(stream: &mut S, limit: usize) -> Result<(UpgradeRequest, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf).context("Invalid HTTP request")? {
            httparse::Status::Complete(head_len) => {
                let parsed = UpgradeRequest::from_parsed(&request);
                let rest = buf[head_len..].to_vec();
                return Ok((parsed, rest));
            }
            httparse::Status::Partial => {
                if buf.len() >= limit {
                    bail!("Request head exceeds {limit} bytes");
                }
            }
        }

        let mut chunk = [0u8; READ_CHUNK];
        let want = READ_CHUNK.min(limit - buf.len());
        let n = stream
            .read(&mut chunk[..want])
            .await
            .context("Failed to read request head")?;
        if n == 0 {
            bail!("Connection closed before request head completed");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Writes an empty-bodied refusal
pub async fn write_rejection<S>(stream: &mut S, status: StatusCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = status_line(status);
    if status == StatusCode::UPGRADE_REQUIRED {
        response.push_str("Upgrade: websocket\r\n");
    }
    response.push_str("Content-Length: 0\r\nConnection: close\r\n\r\n");
    stream
        .write_all(response.as_bytes())
        .await
        .context("Failed to write rejection response")?;
    stream.flush().await.context("Failed to flush rejection response")
}

/// Completes the handshake, echoing the offered protocol so clients accept it
pub async fn write_switching_protocols<S>(
    stream: &mut S,
    websocket_key: &str,
    protocol: Option<&str>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = status_line(StatusCode::SWITCHING_PROTOCOLS);
    response.push_str("Upgrade: websocket\r\nConnection: Upgrade\r\n");
    let accept = derive_accept_key(websocket_key.as_bytes());
    let _ = write!(response, "Sec-WebSocket-Accept: {accept}\r\n");
    if let Some(protocol) = protocol {
        let _ = write!(response, "Sec-WebSocket-Protocol: {protocol}\r\n");
    }
    response.push_str("\r\n");
    stream
        .write_all(response.as_bytes())
        .await
        .context("Failed to write upgrade response")?;
    stream.flush().await.context("Failed to flush upgrade response")
}

fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
}
