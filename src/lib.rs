//! Connect Proxy: service mesh sidecar
//!
//! This library implements a sidecar proxy that fronts one local service.
//! It terminates mutual TLS for inbound mesh traffic on a public listener and
//! originates mutual TLS for outbound traffic through one listener per
//! upstream. The set of listeners follows a stream of configuration
//! snapshots delivered by the control plane or read from a static file.
//!
//! # Main Features
//!
//! - Reconfiguration loop with real diffing of upstream listeners
//! - Identity service fetching CA roots and leaf certificates from the agent
//! - Static development mode with locally supplied certificates
//! - Awaited shutdown of every listener
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use connect_proxy::{AgentClient, ClientConfig, Proxy, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Arc::new(AgentClient::new(ClientConfig::default())?);
//!     let proxy = Arc::new(Proxy::new(client, "web-proxy")?);
//!
//!     let serving = {
//!         let proxy = Arc::clone(&proxy);
//!         tokio::spawn(async move { proxy.serve().await })
//!     };
//!
//!     tokio::signal::ctrl_c().await?;
//!     proxy.close().await;
//!     let _ = serving.await;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod client;
pub mod common;
pub mod config;
pub mod identity;
pub mod proxy;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use client::{AgentClient, ClientConfig, ControlPlaneClient};
pub use common::{parse_socket_addr, ProxyError, Result};
pub use config::{Config, ConfigWatcher};
pub use identity::Service;
pub use proxy::Proxy;
pub use tls::TlsMaterial;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
