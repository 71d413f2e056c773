use anyhow::{Context, Result, anyhow};
use rustls_pemfile::{certs, private_key};
use std::{fs::File, io::BufReader, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::debug;

use crate::config::TlsConfig;
use crate::stream::ClientStream;

/// Builds the acceptor used to terminate TLS on the listener
pub fn build_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = File::open(&tls_config.cert_file)
        .with_context(|| format!("Failed to open certificate file: {}", tls_config.cert_file))?;
    let key_file = File::open(&tls_config.key_file)
        .with_context(|| format!("Failed to open private key file: {}", tls_config.key_file))?;

    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate file")?;
    if cert_chain.is_empty() {
        return Err(anyhow!("No certificates found in {}", tls_config.cert_file));
    }

    let key = private_key(&mut BufReader::new(key_file))
        .context("Failed to parse private key file")?
        .ok_or_else(|| anyhow!("No private key found in {}", tls_config.key_file))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("Failed to create TLS server config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    debug!(cert_file = %tls_config.cert_file, "TLS configuration loaded");

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Wraps an accepted socket, terminating TLS when an acceptor is configured
pub async fn accept_client(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> Result<ClientStream> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?;
            Ok(ClientStream::Tls(Box::new(tls)))
        }
        None => Ok(ClientStream::Plain(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported() {
        let config = TlsConfig {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
        };
        let Err(err) = build_tls_acceptor(&config) else {
            panic!("expected missing certificate error");
        };
        assert!(err.to_string().contains("certificate file"));
    }

    #[tokio::test]
    async fn plain_accept_passes_socket_through() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (client, accepted) = tokio::join!(connect, listener.accept());
        let _client = client.unwrap();
        let (socket, _) = accepted.unwrap();

        let stream = accept_client(socket, None).await.unwrap();
        assert!(matches!(stream, ClientStream::Plain(_)));
    }
}
