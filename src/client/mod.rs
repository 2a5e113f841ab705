//! Control-plane client
//!
//! The proxy talks to its local agent for three things: its own
//! configuration, the TLS identity of the proxied service, and the endpoints
//! behind each upstream. [`ControlPlaneClient`] is that seam; [`AgentClient`]
//! is the HTTP implementation.

mod agent;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::Result;
use crate::config::DestinationType;

pub use agent::{AgentClient, ClientConfig};

/// Proxy configuration as returned by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentProxyConfig {
    /// ID of the proxy service registration
    #[serde(rename = "ProxyServiceID")]
    pub proxy_service_id: String,

    /// ID of the service being proxied
    #[serde(rename = "TargetServiceID")]
    pub target_service_id: String,

    /// Name of the service being proxied
    pub target_service_name: String,

    /// Hash of the whole response; changes whenever the content does
    pub content_hash: String,

    /// Opaque proxy settings (bind address, ports, timeouts, upstreams)
    pub config: serde_json::Map<String, serde_json::Value>,

    /// Upstreams registered alongside the proxy
    pub upstreams: Vec<AgentUpstream>,
}

/// Upstream entry of an agent proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgentUpstream {
    pub destination_type: DestinationType,
    pub destination_namespace: String,
    pub destination_name: String,
    pub datacenter: String,
    pub local_bind_address: String,
    pub local_bind_port: i32,
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// Leaf certificate issued for a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafCert {
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "CertPEM")]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    pub private_key_pem: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "ServiceURI")]
    pub service_uri: String,
}

/// Trusted CA roots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaRoots {
    #[serde(rename = "ActiveRootID")]
    pub active_root_id: String,
    #[serde(rename = "TrustDomain")]
    pub trust_domain: String,
    #[serde(rename = "Roots")]
    pub roots: Vec<CaRoot>,
}

/// A single CA root certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaRoot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RootCert")]
    pub root_cert: String,
    #[serde(rename = "Active")]
    pub active: bool,
}

/// What to look up when resolving an upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointQuery {
    pub destination_type: DestinationType,
    pub namespace: String,
    pub name: String,
    pub datacenter: String,
}

/// A dialable, mesh-enabled endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port` to connect to
    pub address: String,
    /// Expected URI SAN of the peer certificate, when known
    pub cert_uri: Option<String>,
    /// Name of the service registered at this endpoint, if reported
    pub service: String,
    /// Namespace of that service, if reported
    pub namespace: String,
    /// Datacenter of the node running it, if reported
    pub datacenter: String,
}

/// Operations the proxy needs from its control plane
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Fetch the proxy configuration.
    ///
    /// With `wait_index` set this is a blocking query that returns once the
    /// configuration changes past that index (or the agent's wait expires).
    /// Returns the configuration and the index to wait on next.
    async fn proxy_config(
        &self,
        proxy_id: &str,
        wait_index: Option<u64>,
    ) -> Result<(AgentProxyConfig, u64)>;

    /// Fetch the leaf certificate for a service
    async fn leaf_cert(&self, service_id: &str) -> Result<LeafCert>;

    /// Fetch the trusted CA roots
    async fn ca_roots(&self) -> Result<CaRoots>;

    /// List healthy endpoints for an upstream destination
    async fn connect_endpoints(&self, query: &EndpointQuery) -> Result<Vec<Endpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_proxy_config_decodes_agent_json() {
        let body = r#"{
            "ProxyServiceID": "web-proxy",
            "TargetServiceID": "web",
            "TargetServiceName": "web",
            "ContentHash": "a1b2",
            "ExecMode": "daemon",
            "Config": {"bind_port": 20000, "local_service_address": "127.0.0.1:8080"},
            "Upstreams": [
                {"DestinationType": "prepared_query", "DestinationName": "geo-db", "LocalBindPort": 6000}
            ]
        }"#;

        let cfg: AgentProxyConfig = serde_json::from_str(body).unwrap();
        assert_eq!(cfg.proxy_service_id, "web-proxy");
        assert_eq!(cfg.target_service_id, "web");
        assert_eq!(cfg.content_hash, "a1b2");
        assert_eq!(cfg.config["bind_port"], 20000);
        assert_eq!(cfg.upstreams.len(), 1);
        assert_eq!(cfg.upstreams[0].destination_type, DestinationType::PreparedQuery);
        assert_eq!(cfg.upstreams[0].local_bind_port, 6000);
    }

    #[test]
    fn ca_roots_decode() {
        let body = r#"{
            "ActiveRootID": "r1",
            "TrustDomain": "11111111-2222.consul",
            "Roots": [{"ID": "r1", "Name": "Consul CA Root Cert", "RootCert": "PEM", "Active": true}]
        }"#;

        let roots: CaRoots = serde_json::from_str(body).unwrap();
        assert_eq!(roots.trust_domain, "11111111-2222.consul");
        assert!(roots.roots[0].active);
    }
}
