//! Connect Proxy Command Line Tool
//!
//! This binary is the command-line interface for Connect Proxy.

use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use connect_proxy::{AgentClient, ClientConfig, Proxy, APP_NAME, VERSION};
use connect_proxy::common::{init_logger, ProxyError, Result};
use connect_proxy::config::defaults::{HTTP_ADDR_STR, LOG_LEVEL_STR};

/// Connect Proxy: service mesh sidecar with mutual TLS
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// ID of the proxy service registration to follow
    #[clap(long, env = "CONNECT_PROXY_ID")]
    proxy_id: Option<String>,

    /// Static JSON configuration file (development mode)
    #[clap(long, env = "CONNECT_PROXY_DEV_CONFIG", conflicts_with = "proxy_id")]
    dev_config: Option<String>,

    /// Address of the local agent HTTP API
    #[clap(long, env = "CONNECT_HTTP_ADDR", default_value = HTTP_ADDR_STR)]
    http_addr: String,

    /// ACL token sent with agent requests
    #[clap(long, env = "CONNECT_HTTP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level
    #[clap(long, env = "CONNECT_PROXY_LOG_LEVEL", default_value = LOG_LEVEL_STR)]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    init_logger(&args.log_level);

    info!("Starting {} v{}", APP_NAME, VERSION);

    let client = Arc::new(AgentClient::new(ClientConfig {
        address: args.http_addr.clone(),
        token: args.token.clone(),
        ..Default::default()
    })?);

    let proxy = match (&args.proxy_id, &args.dev_config) {
        (_, Some(path)) => {
            info!("Loading static configuration from {}", path);
            Proxy::from_config_file(client, path)?
        }
        (Some(proxy_id), None) => {
            info!("Following configuration of proxy {} from {}", proxy_id, args.http_addr);
            Proxy::new(client, proxy_id)?
        }
        (None, None) => {
            return Err(ProxyError::Config(
                "one of --proxy-id or --dev-config is required".to_string(),
            ))
        }
    };
    let proxy = Arc::new(proxy);

    let mut serving = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.serve().await })
    };

    info!("Proxy service ready, press Ctrl+C to stop");

    let result = tokio::select! {
        joined = &mut serving => match joined {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Other(format!("serve task failed: {}", e))),
        },
        signal = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
            signal.map_err(ProxyError::from)
        }
    };

    proxy.close().await;
    if !serving.is_finished() {
        serving.abort();
    }

    if let Err(e) = &result {
        error!("Proxy failed: {}", e);
    }
    result
}
