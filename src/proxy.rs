use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::protocol::{Role, WebSocketConfig},
};
use tracing::{debug, info, warn};

use crate::client::{client_channel, pump_client_messages, run_client_writer};
use crate::config::TunnelConfig;
use crate::dialer::{Connect, Dialed, TcpConnector, dial_with_fallback};
use crate::downlink::run_downlink;
use crate::protocol::parse_request;
use crate::security::parse_original_client_ip;
use crate::session::Session;
use crate::stream::ClientStream;
use crate::upgrade::{
    Rejection, UpgradeRequest, decode_early_data, read_request_head, write_rejection,
    write_switching_protocols,
};
use crate::uplink::Uplink;

/// Everything a connection needs that outlives it
pub struct ProxyContext<C = TcpConnector> {
    pub tunnel: TunnelConfig,
    pub connector: C,
}

impl ProxyContext {
    #[must_use]
    pub const fn new(tunnel: TunnelConfig) -> Self {
        Self {
            tunnel,
            connector: TcpConnector,
        }
    }
}

impl<C: Connect> ProxyContext<C> {
    #[must_use]
    pub const fn with_connector(tunnel: TunnelConfig, connector: C) -> Self {
        Self { tunnel, connector }
    }
}

/// A request that passed every check and has its outbound connection
struct Accepted {
    websocket_key: String,
    protocol: String,
    initial_payload: Bytes,
    dialed: Dialed,
}

#[tracing::instrument(skip(stream, client_addr, context), fields(client_addr = %client_addr))]
pub async fn handle_connection<C: Connect>(
    mut stream: ClientStream,
    client_addr: SocketAddr,
    context: &ProxyContext<C>,
) -> Result<()> {
    let (request, leftover) = timeout(
        context.tunnel.head_timeout(),
        read_request_head(&mut stream, context.tunnel.max_request_head),
    )
    .await
    .context("Timed out waiting for request head")??;

    let client_ip = request
        .forwarded_for
        .as_deref()
        .and_then(parse_original_client_ip)
        .unwrap_or_else(|| client_addr.ip().to_string());

    let accepted = match admit(&request, context).await {
        Ok(accepted) => accepted,
        Err(rejection) => {
            let status = rejection.status();
            warn!(client_ip = %client_ip, status = status.as_u16(), reason = %rejection, "Rejecting request");
            write_rejection(&mut stream, status).await?;
            return Ok(());
        }
    };

    write_switching_protocols(
        &mut stream,
        &accepted.websocket_key,
        Some(&accepted.protocol),
    )
    .await?;

    let flow = context.tunnel.flow;
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(flow.queue_byte_cap))
        .max_frame_size(Some(flow.queue_byte_cap));
    let websocket =
        WebSocketStream::from_partially_read(stream, leftover, Role::Server, Some(ws_config)).await;

    info!(client_ip = %client_ip, route = ?accepted.dialed.route, "Tunnel established");
    run_tunnel(
        websocket,
        accepted.dialed.stream,
        accepted.initial_payload,
        &context.tunnel,
    )
    .await;
    Ok(())
}

/// Walks a request through upgrade detection, header decoding, authentication
/// and dialing
async fn admit<C: Connect>(
    request: &UpgradeRequest,
    context: &ProxyContext<C>,
) -> Result<Accepted, Rejection> {
    if !request.is_websocket_upgrade() {
        return Err(Rejection::NotUpgrade);
    }
    let websocket_key = request.websocket_key.clone().ok_or(Rejection::MissingKey)?;
    let encoded = request.encoded_header().ok_or(Rejection::MissingHeader)?;
    let data = decode_early_data(encoded).ok_or(Rejection::Undecodable)?;

    let parsed = parse_request(&data, &context.tunnel.token)?;
    info!(
        target_host = %parsed.host,
        target_port = parsed.port,
        host = request.host.as_deref().unwrap_or_default(),
        "Routing request"
    );

    let dialed = dial_with_fallback(
        &context.connector,
        &parsed.host,
        parsed.port,
        &context.tunnel.fallback,
        context.tunnel.dial_timeout(),
    )
    .await?;

    Ok(Accepted {
        websocket_key,
        protocol: encoded.to_string(),
        initial_payload: Bytes::copy_from_slice(parsed.initial_payload(&data)),
        dialed,
    })
}

/// Splices the client WebSocket and the target connection until either side ends
pub async fn run_tunnel<S>(
    websocket: WebSocketStream<S>,
    target: TcpStream,
    initial_payload: Bytes,
    tunnel: &TunnelConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = Session::new();
    let (ws_sender, ws_receiver) = websocket.split();
    let (tcp_reader, tcp_writer) = target.into_split();
    let (outbound, queue) = client_channel();

    let uplink = Uplink::new(&session, tunnel.flow);
    uplink.push(initial_payload);

    let downlink = async {
        run_downlink(&session, tcp_reader, &outbound, &tunnel.flow).await;
        drop(outbound);
    };

    tokio::join!(
        pump_client_messages(&session, ws_receiver, &uplink),
        uplink.drain(tcp_writer),
        downlink,
        run_client_writer(&session, ws_sender, queue, tunnel.close_grace()),
    );

    match session.cause() {
        Some(cause) => info!(cause = %cause, "Proxy connection closed"),
        None => debug!("Proxy connection closed"),
    }
}

/// Accepts one raw socket, runs the TLS layer if configured, and serves it
pub async fn serve_socket<C: Connect>(
    socket: TcpStream,
    client_addr: SocketAddr,
    acceptor: Option<&tokio_rustls::TlsAcceptor>,
    context: &ProxyContext<C>,
) -> Result<()> {
    let stream = crate::tls::accept_client(socket, acceptor)
        .await
        .with_context(|| format!("Failed to accept connection from {client_addr}"))?;
    handle_connection(stream, client_addr, context).await
}
