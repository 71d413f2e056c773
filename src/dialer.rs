use std::{future::Future, io, time::Duration};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Endpoint;

/// Opens outbound connections
pub trait Connect: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> impl Future<Output = io::Result<TcpStream>> + Send {
        TcpStream::connect((host, port))
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("connection to {host}:{port} timed out after {limit:?}")]
    TimedOut {
        host: String,
        port: u16,
        limit: Duration,
    },
    #[error("connection to {host}:{port} failed: {source}")]
    Failed {
        host: String,
        port: u16,
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Fallback,
}

#[derive(Debug)]
pub struct Dialed {
    pub stream: TcpStream,
    pub route: Route,
}

/// Connects to `host:port`, giving up after `limit`. The timer is dropped with
/// whichever side of the race loses.
pub async fn dial<C: Connect>(
    connector: &C,
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<TcpStream, DialError> {
    match tokio::time::timeout(limit, connector.connect(host, port)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(DialError::Failed {
            host: host.to_string(),
            port,
            source,
        }),
        Err(_) => Err(DialError::TimedOut {
            host: host.to_string(),
            port,
            limit,
        }),
    }
}

/// Tries the requested destination, then the fallback relay exactly once
pub async fn dial_with_fallback<C: Connect>(
    connector: &C,
    host: &str,
    port: u16,
    fallback: &Endpoint,
    limit: Duration,
) -> Result<Dialed, DialError> {
    match dial(connector, host, port, limit).await {
        Ok(stream) => {
            info!(target_host = %host, target_port = port, "Connected to target server");
            return Ok(Dialed {
                stream,
                route: Route::Direct,
            });
        }
        Err(e) => {
            warn!(error = %e, "Direct dial failed, trying fallback relay");
        }
    }

    let stream = dial(connector, &fallback.host, fallback.port, limit).await?;
    info!(
        relay_host = %fallback.host,
        relay_port = fallback.port,
        "Connected to fallback relay"
    );
    Ok(Dialed {
        stream,
        route: Route::Fallback,
    })
}
