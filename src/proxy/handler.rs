//! Connection handler module
//!
//! This module handles individual connections accepted by a listener:
//! inbound connections are TLS-terminated and forwarded to the local
//! service, outbound connections are TLS-originated towards a resolved
//! upstream endpoint.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use openssl::ssl::Ssl;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{ProxyError, Result};
use crate::config::{PublicListenerConfig, UpstreamConfig};
use crate::identity::Service;
use crate::tls::{subject_string, uri_sans};
use super::forwarder::proxy_data;
use super::resolver::Resolver;

/// Handle one inbound connection on the public listener
///
/// # Parameters
///
/// * `client_stream` - Accepted TCP stream
/// * `service` - Identity presented to the client
/// * `config` - Public listener configuration with defaults applied
pub async fn handle_inbound(
    client_stream: TcpStream,
    service: Arc<Service>,
    config: &PublicListenerConfig,
) -> Result<()> {
    let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms);

    // The handshake cannot start before the identity exists.
    let material = timeout(handshake_timeout, service.ready_wait())
        .await
        .map_err(|_| ProxyError::Timeout("waiting for service identity".to_string()))??;

    let ssl = Ssl::new(material.acceptor().context())?;
    let mut stream = Pin::new(Box::new(SslStream::new(ssl, client_stream)?));

    match timeout(handshake_timeout, stream.as_mut().accept()).await {
        Err(_) => return Err(ProxyError::Timeout("inbound TLS handshake".to_string())),
        Ok(Err(e)) => return Err(ProxyError::TlsHandshake(e.to_string())),
        Ok(Ok(())) => {}
    }

    if let Some(cert) = stream.ssl().peer_certificate() {
        info!(
            "Accepted mTLS connection from {} ({})",
            uri_sans(&cert).join(","),
            subject_string(&cert)
        );
    }

    let connect_timeout = Duration::from_millis(config.local_connect_timeout_ms);
    let target_stream = timeout(connect_timeout, TcpStream::connect(&config.local_service_address))
        .await
        .map_err(|_| {
            ProxyError::Timeout(format!("connecting to {}", config.local_service_address))
        })??;

    proxy_data(stream, target_stream).await
}

/// Handle one outbound connection on an upstream listener
///
/// # Parameters
///
/// * `client_stream` - Accepted TCP stream from the local application
/// * `service` - Identity presented to the upstream
/// * `config` - Upstream configuration with defaults applied
/// * `resolver` - Source of the endpoint to dial
pub async fn handle_outbound(
    client_stream: TcpStream,
    service: Arc<Service>,
    config: &UpstreamConfig,
    resolver: Arc<dyn Resolver>,
) -> Result<()> {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);

    let material = timeout(connect_timeout, service.ready_wait())
        .await
        .map_err(|_| ProxyError::Timeout("waiting for service identity".to_string()))??;
    let endpoint = resolver.resolve().await?;
    debug!("Upstream {} dialing {}", config, endpoint.address);

    let target_stream = timeout(connect_timeout, TcpStream::connect(&endpoint.address))
        .await
        .map_err(|_| ProxyError::Timeout(format!("connecting to {}", endpoint.address)))??;

    // Mesh endpoints are authenticated by URI SAN, not by host name.
    let ssl = material
        .connector()
        .configure()?
        .verify_hostname(false)
        .use_server_name_indication(false)
        .into_ssl("")?;
    let mut stream = Pin::new(Box::new(SslStream::new(ssl, target_stream)?));

    match timeout(connect_timeout, stream.as_mut().connect()).await {
        Err(_) => return Err(ProxyError::Timeout("outbound TLS handshake".to_string())),
        Ok(Err(e)) => return Err(ProxyError::TlsHandshake(e.to_string())),
        Ok(Ok(())) => {}
    }

    if let Some(expected) = &endpoint.cert_uri {
        let presented = stream
            .ssl()
            .peer_certificate()
            .map(|cert| uri_sans(&cert))
            .unwrap_or_default();
        if !presented.iter().any(|uri| uri == expected) {
            return Err(ProxyError::Certificate(format!(
                "upstream {} presented {:?}, expected {}",
                endpoint.address, presented, expected
            )));
        }
    }

    proxy_data(client_stream, stream).await
}
