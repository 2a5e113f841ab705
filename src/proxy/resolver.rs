//! Upstream endpoint resolution
//!
//! An upstream listener asks its [`Resolver`] for a destination on every
//! accepted connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::OnceCell;

use crate::client::{ControlPlaneClient, Endpoint, EndpointQuery};
use crate::common::{ProxyError, Result};
use crate::config::UpstreamConfig;

/// Picks the endpoint an outbound connection should dial
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Return one endpoint for the next connection
    async fn resolve(&self) -> Result<Endpoint>;
}

/// Resolver that always returns the same endpoint
#[derive(Debug, Clone)]
pub struct StaticResolver {
    endpoint: Endpoint,
}

impl StaticResolver {
    /// Resolve to `address`, optionally verifying the peer's URI SAN
    pub fn new(address: impl Into<String>, cert_uri: Option<String>) -> Self {
        Self {
            endpoint: Endpoint {
                address: address.into(),
                cert_uri,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self) -> Result<Endpoint> {
        Ok(self.endpoint.clone())
    }
}

/// URI SAN of a service's leaf certificate
pub fn service_uri(trust_domain: &str, namespace: &str, datacenter: &str, service: &str) -> String {
    format!(
        "spiffe://{}/ns/{}/dc/{}/svc/{}",
        trust_domain, namespace, datacenter, service
    )
}

/// Resolver backed by the control plane's catalog
///
/// Each call fetches the current healthy endpoints and rotates through them.
/// Endpoints that report their service and datacenter are given the URI SAN
/// the peer must present, under the trust domain of the CA roots.
pub struct CatalogResolver {
    client: Arc<dyn ControlPlaneClient>,
    query: EndpointQuery,
    next: AtomicUsize,
    trust_domain: OnceCell<String>,
}

impl CatalogResolver {
    pub fn new(client: Arc<dyn ControlPlaneClient>, query: EndpointQuery) -> Self {
        Self {
            client,
            query,
            next: AtomicUsize::new(0),
            trust_domain: OnceCell::new(),
        }
    }

    async fn trust_domain(&self) -> Result<&str> {
        let domain = self
            .trust_domain
            .get_or_try_init(|| async {
                let roots = self.client.ca_roots().await?;
                if roots.trust_domain.is_empty() {
                    return Err(ProxyError::Certificate(
                        "CA roots carry no trust domain".to_string(),
                    ));
                }
                Ok::<_, ProxyError>(roots.trust_domain)
            })
            .await?;
        Ok(domain.as_str())
    }

    /// Fill in the expected URI SAN of `endpoint` when it can be derived
    async fn expect_identity(&self, endpoint: &mut Endpoint) -> Result<()> {
        if endpoint.cert_uri.is_some() || endpoint.service.is_empty() {
            return Ok(());
        }
        let datacenter = if endpoint.datacenter.is_empty() {
            &self.query.datacenter
        } else {
            &endpoint.datacenter
        };
        if datacenter.is_empty() {
            return Ok(());
        }
        let namespace = if endpoint.namespace.is_empty() {
            &self.query.namespace
        } else {
            &endpoint.namespace
        };

        let uri = service_uri(self.trust_domain().await?, namespace, datacenter, &endpoint.service);
        endpoint.cert_uri = Some(uri);
        Ok(())
    }
}

#[async_trait]
impl Resolver for CatalogResolver {
    async fn resolve(&self) -> Result<Endpoint> {
        let mut endpoints = self.client.connect_endpoints(&self.query).await?;
        if endpoints.is_empty() {
            return Err(ProxyError::Other(format!(
                "no healthy endpoints for {} {}",
                self.query.destination_type, self.query.name
            )));
        }

        let idx = self.next.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        let mut endpoint = endpoints.swap_remove(idx);
        self.expect_identity(&mut endpoint).await?;
        debug!(
            "Resolved {} to {} ({})",
            self.query.name,
            endpoint.address,
            endpoint.cert_uri.as_deref().unwrap_or("no identity check")
        );
        Ok(endpoint)
    }
}

/// Build the catalog resolver for an upstream
pub fn resolver_from_client(
    client: Arc<dyn ControlPlaneClient>,
    upstream: &UpstreamConfig,
) -> Arc<dyn Resolver> {
    let query = EndpointQuery {
        destination_type: upstream.destination_type,
        namespace: upstream.destination_namespace.clone(),
        name: upstream.destination_name.clone(),
        datacenter: upstream.destination_datacenter.clone(),
    };
    Arc::new(CatalogResolver::new(client, query))
}
