//! Configuration loading functionality
//!
//! Snapshots come from one of two places: a local JSON file (development
//! mode) or a proxy-config response from the control-plane agent.

use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use serde_json::Value;

use crate::client::{AgentProxyConfig, AgentUpstream};
use crate::config::error::{ConfigError, Result};
use crate::config::types::{Config, PublicListenerConfig, UpstreamConfig};
use crate::config::defaults;

impl Config {
    /// Load a snapshot from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConfigError::FileNotFound(path.to_path_buf()),
            _ => ConfigError::FileReadError(path.to_path_buf(), e.to_string()),
        })?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        debug!(
            "Loaded configuration from {} ({} upstreams)",
            path.display(),
            config.upstreams.len()
        );
        Ok(config)
    }

    /// Build a snapshot from the agent's view of this proxy
    ///
    /// Public listener settings are read from the opaque `Config` map.
    /// Upstreams come from the registration's `Upstreams` list, or from an
    /// `upstreams` array inside the map when the registration has none.
    pub fn from_agent(proxy_id: &str, resp: &AgentProxyConfig) -> Result<Self> {
        let public_listener: PublicListenerConfig =
            serde_json::from_value(Value::Object(resp.config.clone()))?;

        let upstreams = if !resp.upstreams.is_empty() {
            resp.upstreams.iter().map(upstream_from_agent).collect()
        } else {
            match resp.config.get("upstreams") {
                Some(list @ Value::Array(_)) => serde_json::from_value(list.clone())?,
                Some(other) => {
                    return Err(ConfigError::InvalidValue(
                        "upstreams".to_string(),
                        format!("expected a list, got {}", other),
                    ))
                }
                None => Vec::new(),
            }
        };

        Ok(Config {
            proxy_id: proxy_id.to_string(),
            proxied_service_name: resp.target_service_name.clone(),
            proxied_service_id: resp.target_service_id.clone(),
            proxied_service_namespace: defaults::UPSTREAM_NAMESPACE.to_string(),
            public_listener,
            upstreams,
            ..Default::default()
        })
    }
}

fn upstream_from_agent(upstream: &AgentUpstream) -> UpstreamConfig {
    let connect_timeout_ms = upstream
        .config
        .get("connect_timeout_ms")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    UpstreamConfig {
        local_bind_address: upstream.local_bind_address.clone(),
        local_bind_port: upstream.local_bind_port,
        destination_type: upstream.destination_type,
        destination_namespace: upstream.destination_namespace.clone(),
        destination_name: upstream.destination_name.clone(),
        destination_datacenter: upstream.datacenter.clone(),
        connect_timeout_ms,
    }
}
