//! HTTP client for the local control-plane agent

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use super::{AgentProxyConfig, CaRoots, ControlPlaneClient, Endpoint, EndpointQuery, LeafCert};
use crate::common::{ProxyError, Result};
use crate::config::{defaults, DestinationType};

/// Header carrying the blocking-query index
const INDEX_HEADER: &str = "X-Consul-Index";

/// Header carrying the ACL token
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Extra time on top of the blocking wait before a request is abandoned
const REQUEST_GRACE: Duration = Duration::from_secs(10);

/// Settings for [`AgentClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` or full URL of the agent HTTP API
    pub address: String,
    /// ACL token, if any
    pub token: Option<String>,
    /// How long a blocking query may wait for a change
    pub wait_time: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: defaults::HTTP_ADDR_STR.to_string(),
            token: None,
            wait_time: defaults::BLOCKING_QUERY_WAIT,
        }
    }
}

/// Control-plane client speaking the agent's HTTP API
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    wait_time: Duration,
}

/// `CheckServiceNode` subset used for endpoint selection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: NodeInfo,
    service: ServiceInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
    #[serde(default)]
    datacenter: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(default)]
    service: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryResponse {
    #[serde(default)]
    nodes: Vec<ServiceEntry>,
}

impl ServiceEntry {
    fn into_endpoint(self) -> Endpoint {
        // Services registered without an address inherit the node's.
        let host = if self.service.address.is_empty() {
            self.node.address
        } else {
            self.service.address
        };
        Endpoint {
            address: format!("{}:{}", host, self.service.port),
            cert_uri: None,
            service: self.service.service,
            namespace: self.service.namespace,
            datacenter: self.node.datacenter,
        }
    }
}

impl AgentClient {
    /// Create a client for the agent described by `config`
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::ControlPlane(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = if config.address.starts_with("http://") || config.address.starts_with("https://") {
            config.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.address.trim_end_matches('/'))
        };

        Ok(Self {
            http,
            base_url,
            token: config.token,
            wait_time: config.wait_time,
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::ControlPlane(format!(
            "{} failed with status {}: {}",
            what,
            status,
            body.trim()
        )))
    }
}

/// Parse the index header, defaulting to 0 when it is absent or malformed
fn response_index(response: &Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ControlPlaneClient for AgentClient {
    async fn proxy_config(
        &self,
        proxy_id: &str,
        wait_index: Option<u64>,
    ) -> Result<(AgentProxyConfig, u64)> {
        let mut request = self.get(&format!("/v1/agent/connect/proxy/{}", proxy_id));
        if let Some(index) = wait_index {
            request = request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", self.wait_time.as_secs())),
                ])
                .timeout(self.wait_time + REQUEST_GRACE);
        }

        let response = self.send(request, "proxy config request").await?;
        let index = response_index(&response);
        let config = response.json::<AgentProxyConfig>().await?;
        debug!("Fetched proxy config for {} at index {}", proxy_id, index);
        Ok((config, index))
    }

    async fn leaf_cert(&self, service_id: &str) -> Result<LeafCert> {
        let request = self.get(&format!("/v1/agent/connect/ca/leaf/{}", service_id));
        let response = self.send(request, "leaf certificate request").await?;
        Ok(response.json::<LeafCert>().await?)
    }

    async fn ca_roots(&self) -> Result<CaRoots> {
        let request = self.get("/v1/agent/connect/ca/roots");
        let response = self.send(request, "CA roots request").await?;
        Ok(response.json::<CaRoots>().await?)
    }

    async fn connect_endpoints(&self, query: &EndpointQuery) -> Result<Vec<Endpoint>> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if !query.datacenter.is_empty() {
            params.push(("dc", query.datacenter.as_str()));
        }

        let entries = match query.destination_type {
            DestinationType::Service => {
                params.push(("passing", "1"));
                let request = self
                    .get(&format!("/v1/health/connect/{}", query.name))
                    .query(&params);
                let response = self.send(request, "service health request").await?;
                response.json::<Vec<ServiceEntry>>().await?
            }
            DestinationType::PreparedQuery => {
                params.push(("connect", "true"));
                let request = self
                    .get(&format!("/v1/query/{}/execute", query.name))
                    .query(&params);
                let response = self.send(request, "prepared query request").await?;
                response.json::<QueryResponse>().await?.nodes
            }
        };

        Ok(entries.into_iter().map(ServiceEntry::into_endpoint).collect())
    }
}
