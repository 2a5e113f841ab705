//! Configuration tests
//!
//! This module contains tests for loading configuration snapshots.

use std::fs;

use connect_proxy::client::AgentProxyConfig;
use connect_proxy::config::{Config, ConfigError, DestinationType};

/// Test configuration from file
#[test]
fn test_file_config() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config_path = dir.path().join("proxy.json");
    let config_content = r#"{
        "proxy_id": "web-proxy",
        "proxied_service_name": "web",
        "proxied_service_id": "web-1",
        "public_listener": {
            "bind_port": 21000,
            "local_service_address": "127.0.0.1:8080",
            "handshake_timeout_ms": 2500
        },
        "upstreams": [
            {"destination_name": "db", "local_bind_port": 5000},
            {"destination_type": "prepared_query", "destination_name": "geo-cache",
             "local_bind_address": "127.0.0.2", "local_bind_port": 6000,
             "destination_datacenter": "dc2"}
        ]
    }"#;
    fs::write(&config_path, config_content).expect("Failed to write test config file");

    let config = Config::from_file(&config_path).expect("Failed to load config from file");
    assert_eq!(config.proxy_id, "web-proxy");
    assert_eq!(config.proxied_service_id, "web-1");

    // Loading does not apply defaults
    assert_eq!(config.public_listener.bind_address, "");
    let public = config.public_listener.clone().with_defaults();
    assert_eq!(public.bind_target(), "0.0.0.0:21000");
    assert_eq!(public.handshake_timeout_ms, 2500);
    assert_eq!(public.local_connect_timeout_ms, 1000);

    let keys: Vec<String> = config
        .upstreams
        .iter()
        .map(|u| u.clone().with_defaults().to_string())
        .collect();
    assert_eq!(
        keys,
        vec![
            "127.0.0.1:5000->service:default/db".to_string(),
            "127.0.0.2:6000->prepared_query:default/geo-cache".to_string(),
        ]
    );
    assert_eq!(config.upstreams[1].destination_type, DestinationType::PreparedQuery);
    assert_eq!(config.upstreams[1].destination_datacenter, "dc2");
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let result = Config::from_file(dir.path().join("absent.json"));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_agent_config() {
    let body = r#"{
        "ProxyServiceID": "web-proxy",
        "TargetServiceID": "web-1",
        "TargetServiceName": "web",
        "ContentHash": "4f2a",
        "Config": {
            "bind_address": "10.0.0.7",
            "bind_port": 20000,
            "local_service_address": "127.0.0.1:8080"
        },
        "Upstreams": [
            {"DestinationName": "db", "LocalBindPort": 5000,
             "Config": {"connect_timeout_ms": 3000}}
        ]
    }"#;
    let resp: AgentProxyConfig = serde_json::from_str(body).expect("Failed to decode agent response");

    let config = Config::from_agent("web-proxy", &resp).expect("Failed to convert agent response");
    assert_eq!(config.proxied_service_id, "web-1");
    assert_eq!(config.proxied_service_name, "web");
    assert_eq!(config.public_listener.bind_target(), "10.0.0.7:20000");
    assert_eq!(config.upstreams.len(), 1);
    assert_eq!(config.upstreams[0].connect_timeout_ms, 3000);
    assert!(config.upstreams[0].has_bind_port());
}
