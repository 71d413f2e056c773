use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use ws_tunnel::{
    ProxyAllowlist, ProxyContext, build_tls_acceptor, config::DEFAULT_CONFIG_PATH,
    load_config_from, serve_socket,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config_from(&config_path)?;
    info!(
        config_file = %config_path,
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        fallback_host = %config.tunnel.fallback.host,
        fallback_port = config.tunnel.fallback.port,
        dial_timeout_ms = config.tunnel.dial_timeout_ms,
        "Configuration loaded"
    );

    let allowlist = ProxyAllowlist::parse(config.listen.allowed_proxy_ips.as_deref())?;
    let acceptor = config
        .listen
        .tls
        .as_ref()
        .map(build_tls_acceptor)
        .transpose()?;

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;
    info!(listen_addr = %addr, "WebSocket tunnel listening");

    let context = Arc::new(ProxyContext::new(config.tunnel));

    while let Ok((socket, client_addr)) = listener.accept().await {
        if !allowlist.allows(client_addr.ip()) {
            warn!(client_addr = %client_addr, "Rejecting connection from non-allowed proxy IP");
            continue;
        }

        let context = context.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_socket(socket, client_addr, acceptor.as_ref(), &context).await {
                error!(client_addr = %client_addr, error = %e, "Connection failed");
            }
        });
    }

    Ok(())
}
