//! Listeners
//!
//! A [`Listener`] owns one bound socket and serves connections on it until
//! closed. The public listener terminates mutual TLS for the local service;
//! upstream listeners originate mutual TLS towards a remote service.
//! Listeners are produced by a [`ListenerFactory`] so the proxy's
//! reconfiguration logic does not depend on real sockets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::common::{bind_listener, parse_socket_addr, ProxyError, Result};
use crate::config::{PublicListenerConfig, UpstreamConfig};
use crate::identity::Service;
use super::handler::{handle_inbound, handle_outbound};
use super::resolver::Resolver;

/// A bound socket serving proxied connections
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address the socket is bound to
    fn bind_addr(&self) -> SocketAddr;

    /// Accept and handle connections until [`Listener::close`] is called.
    ///
    /// May be called at most once.
    async fn serve(&self) -> Result<()>;

    /// Stop accepting and drop open connections. Safe to call repeatedly.
    fn close(&self);
}

/// Creates bound listeners from configuration
///
/// Configurations are expected to have their defaults applied already.
pub trait ListenerFactory: Send + Sync {
    /// Bind the inbound listener
    fn public_listener(
        &self,
        service: &Arc<Service>,
        config: &PublicListenerConfig,
    ) -> Result<Arc<dyn Listener>>;

    /// Bind an outbound listener
    fn upstream_listener(
        &self,
        service: &Arc<Service>,
        config: &UpstreamConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Arc<dyn Listener>>;
}

/// Factory binding real TCP sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpListenerFactory;

impl TcpListenerFactory {
    fn bind(target: &str) -> Result<TcpListener> {
        let addr = parse_socket_addr(target)?;
        let std_listener = bind_listener(addr)?;
        Ok(TcpListener::from_std(std_listener)?)
    }
}

impl ListenerFactory for TcpListenerFactory {
    fn public_listener(
        &self,
        service: &Arc<Service>,
        config: &PublicListenerConfig,
    ) -> Result<Arc<dyn Listener>> {
        let socket = Self::bind(&config.bind_target())?;
        Ok(Arc::new(ProxyListener::new(
            socket,
            Arc::clone(service),
            Role::Public(config.clone()),
        )?))
    }

    fn upstream_listener(
        &self,
        service: &Arc<Service>,
        config: &UpstreamConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Arc<dyn Listener>> {
        if !config.has_bind_port() {
            return Err(ProxyError::Config(format!(
                "upstream {} has no local_bind_port",
                config
            )));
        }
        let socket = Self::bind(&config.bind_target())?;
        Ok(Arc::new(ProxyListener::new(
            socket,
            Arc::clone(service),
            Role::Upstream(config.clone(), resolver),
        )?))
    }
}

/// What a [`ProxyListener`] does with accepted connections
enum Role {
    Public(PublicListenerConfig),
    Upstream(UpstreamConfig, Arc<dyn Resolver>),
}

/// Listener over a bound TCP socket
pub struct ProxyListener {
    addr: SocketAddr,
    socket: Mutex<Option<TcpListener>>,
    service: Arc<Service>,
    role: Arc<Role>,
    shutdown: CancellationToken,
}

impl ProxyListener {
    fn new(socket: TcpListener, service: Arc<Service>, role: Role) -> Result<Self> {
        Ok(Self {
            addr: socket.local_addr()?,
            socket: Mutex::new(Some(socket)),
            service,
            role: Arc::new(role),
            shutdown: CancellationToken::new(),
        })
    }

    fn take_socket(&self) -> Result<TcpListener> {
        self.socket
            .lock()
            .map_err(|_| ProxyError::Other("listener lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| ProxyError::Other(format!("listener {} already served", self.addr)))
    }

    fn spawn_handler(&self, connections: &mut JoinSet<()>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let service = Arc::clone(&self.service);
        let role = Arc::clone(&self.role);
        let addr = self.addr;

        connections.spawn(async move {
            let result = match role.as_ref() {
                Role::Public(config) => handle_inbound(stream, service, config).await,
                Role::Upstream(config, resolver) => {
                    handle_outbound(stream, service, config, Arc::clone(resolver)).await
                }
            };
            match result {
                Ok(()) => debug!("Connection {} via {} finished", peer, addr),
                Err(e) => warn!("Connection {} via {} failed: {}", peer, addr, e),
            }
        });
    }
}

#[async_trait]
impl Listener for ProxyListener {
    fn bind_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn serve(&self) -> Result<()> {
        let socket = self.take_socket()?;
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {} on {}", peer, self.addr);
                        self.spawn_handler(&mut connections, stream, peer);
                    }
                    Err(e) => error!("Error accepting connection on {}: {}", self.addr, e),
                },
                Some(joined) = connections.join_next() => {
                    if let Err(e) = joined {
                        error!("Connection task error: {}", e);
                    }
                }
            }
        }

        // Dropping the socket stops new connections; open ones are aborted.
        drop(socket);
        connections.shutdown().await;
        debug!("Listener on {} closed", self.addr);
        Ok(())
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}
