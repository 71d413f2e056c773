//! WebSocket Tunnel Server
//!
//! Accepts WebSocket upgrades whose `Sec-WebSocket-Protocol` field carries a
//! Base64-encoded, token-authenticated request header naming a TCP destination,
//! dials that destination (or a fallback relay), and splices the two connections.
//! Supports TLS termination and proxy IP filtering.

pub mod client;
pub mod config;
pub mod dialer;
pub mod downlink;
pub mod protocol;
pub mod proxy;
pub mod security;
pub mod session;
pub mod stream;
pub mod tls;
pub mod upgrade;
pub mod uplink;

// Re-export commonly used types and functions
pub use config::{
    Config, Endpoint, FlowConfig, ListenConfig, TlsConfig, TunnelConfig, load_config_from,
};
pub use dialer::{Connect, TcpConnector};
pub use protocol::{HeaderError, ParsedRequest, parse_request};
pub use proxy::{ProxyContext, handle_connection, run_tunnel, serve_socket};
pub use security::{AccessToken, ProxyAllowlist, parse_original_client_ip};
pub use session::{Cause, Session};
pub use stream::ClientStream;
pub use tls::build_tls_acceptor;
pub use upgrade::Rejection;
