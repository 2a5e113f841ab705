//! Configuration types
//!
//! A [`Config`] is one immutable snapshot of the desired proxy state. The
//! proxy never edits a delivered snapshot: defaults are applied to derived
//! copies through the `with_defaults` methods.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::config::defaults;
use crate::config::error::ConfigError;

/// Configuration snapshot for one proxy instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ID of this proxy, as registered with the control plane
    pub proxy_id: String,

    /// Name of the service this proxy fronts
    pub proxied_service_name: String,

    /// ID of the service this proxy fronts; drives the TLS identity
    pub proxied_service_id: String,

    /// Namespace of the proxied service
    pub proxied_service_namespace: String,

    /// The single inbound listener
    pub public_listener: PublicListenerConfig,

    /// Outbound listeners, in source order
    pub upstreams: Vec<UpstreamConfig>,

    /// CA bundle used in development mode
    pub dev_ca_file: Option<PathBuf>,

    /// Service certificate used in development mode
    pub dev_service_cert_file: Option<PathBuf>,

    /// Service private key used in development mode
    pub dev_service_key_file: Option<PathBuf>,
}

/// Inbound listener configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicListenerConfig {
    /// Address to bind on
    pub bind_address: String,

    /// Port to bind on
    pub bind_port: u16,

    /// `host:port` of the local service that receives proxied traffic
    pub local_service_address: String,

    /// Milliseconds allowed to connect to the local service
    pub local_connect_timeout_ms: u64,

    /// Milliseconds allowed for the inbound TLS handshake
    pub handshake_timeout_ms: u64,
}

impl PublicListenerConfig {
    /// Return a copy with unset fields filled in
    pub fn with_defaults(mut self) -> Self {
        if self.local_connect_timeout_ms == 0 {
            self.local_connect_timeout_ms = defaults::LOCAL_CONNECT_TIMEOUT_MS;
        }
        if self.handshake_timeout_ms == 0 {
            self.handshake_timeout_ms = defaults::HANDSHAKE_TIMEOUT_MS;
        }
        if self.bind_address.is_empty() {
            self.bind_address = defaults::PUBLIC_BIND_ADDRESS.to_string();
        }
        self
    }

    /// `address:port` the listener binds to
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

/// What an upstream's destination name refers to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    /// A service registered in the catalog
    #[default]
    Service,
    /// A prepared query executed by the control plane
    PreparedQuery,
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Service => write!(f, "service"),
            DestinationType::PreparedQuery => write!(f, "prepared_query"),
        }
    }
}

impl FromStr for DestinationType {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "service" => Ok(Self::Service),
            "prepared_query" => Ok(Self::PreparedQuery),
            _ => Err(ConfigError::InvalidValue(
                "destination_type".to_string(),
                format!("{}. Valid values are: service, prepared_query", s),
            )),
        }
    }
}

/// Outbound listener configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Address the local listener binds to
    pub local_bind_address: String,

    /// Port the local listener binds to; anything below 1 leaves the upstream inert
    pub local_bind_port: i32,

    /// Kind of destination
    pub destination_type: DestinationType,

    /// Namespace of the destination
    pub destination_namespace: String,

    /// Service name or prepared query name
    pub destination_name: String,

    /// Datacenter to resolve in; empty means the local one
    pub destination_datacenter: String,

    /// Milliseconds allowed to connect to a resolved endpoint
    pub connect_timeout_ms: u64,
}

impl UpstreamConfig {
    /// Return a copy with unset fields filled in
    pub fn with_defaults(mut self) -> Self {
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = defaults::UPSTREAM_CONNECT_TIMEOUT_MS;
        }
        if self.destination_namespace.is_empty() {
            self.destination_namespace = defaults::UPSTREAM_NAMESPACE.to_string();
        }
        if self.local_bind_address.is_empty() {
            self.local_bind_address = defaults::UPSTREAM_BIND_ADDRESS.to_string();
        }
        self
    }

    /// Whether the upstream has a usable local bind port
    pub fn has_bind_port(&self) -> bool {
        self.local_bind_port >= 1
    }

    /// `address:port` the listener binds to
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.local_bind_address, self.local_bind_port)
    }
}

/// Stable identity string, used as the key when diffing snapshots
impl fmt::Display for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}/{}",
            self.local_bind_address,
            self.local_bind_port,
            self.destination_type,
            self.destination_namespace,
            self.destination_name
        )
    }
}
