//! Proxy service module
//!
//! This module implements the runtime core of the sidecar: the
//! reconfiguration loop in [`server`], the listeners it starts, the
//! per-connection handlers and the byte forwarder they share.

pub mod server;
pub mod listener;
pub mod resolver;
mod handler;
mod forwarder;

pub use server::Proxy;
pub use listener::{Listener, ListenerFactory, ProxyListener, TcpListenerFactory};
pub use resolver::{resolver_from_client, CatalogResolver, Resolver, StaticResolver};
