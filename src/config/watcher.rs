//! Configuration watchers
//!
//! A [`ConfigWatcher`] produces the sequence of snapshots a proxy applies.
//! [`StaticConfigWatcher`] serves a fixed configuration (development mode);
//! [`AgentConfigWatcher`] follows the control plane with blocking queries.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::ControlPlaneClient;
use crate::common::{ProxyError, Result};
use crate::config::defaults;
use crate::config::types::Config;

/// Source of configuration snapshots
#[async_trait]
pub trait ConfigWatcher: Send {
    /// Wait for the next snapshot.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no
    /// snapshot. `None` means no further snapshots will ever arrive.
    async fn next(&mut self) -> Option<Config>;
}

/// Watcher that delivers one fixed snapshot and then nothing
#[derive(Debug)]
pub struct StaticConfigWatcher {
    config: Option<Config>,
}

impl StaticConfigWatcher {
    /// Create a watcher for `config`
    pub fn new(config: Config) -> Self {
        Self { config: Some(config) }
    }
}

#[async_trait]
impl ConfigWatcher for StaticConfigWatcher {
    async fn next(&mut self) -> Option<Config> {
        match self.config.take() {
            Some(config) => Some(config),
            // A static file never changes; stay silent rather than report closure.
            None => futures::future::pending().await,
        }
    }
}

/// Watcher that follows the proxy's configuration on the control plane
pub struct AgentConfigWatcher {
    client: Arc<dyn ControlPlaneClient>,
    proxy_id: String,
    updates: Option<mpsc::Receiver<Config>>,
    shutdown: CancellationToken,
}

impl AgentConfigWatcher {
    /// Create a watcher for `proxy_id`.
    ///
    /// Polling starts on the first call to [`ConfigWatcher::next`].
    pub fn new(client: Arc<dyn ControlPlaneClient>, proxy_id: &str) -> Result<Self> {
        if proxy_id.is_empty() {
            return Err(ProxyError::Config("proxy ID must not be empty".to_string()));
        }
        Ok(Self {
            client,
            proxy_id: proxy_id.to_string(),
            updates: None,
            shutdown: CancellationToken::new(),
        })
    }

    fn start(&self) -> mpsc::Receiver<Config> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(poll_agent(
            Arc::clone(&self.client),
            self.proxy_id.clone(),
            tx,
            self.shutdown.clone(),
        ));
        rx
    }
}

impl Drop for AgentConfigWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl ConfigWatcher for AgentConfigWatcher {
    async fn next(&mut self) -> Option<Config> {
        if self.updates.is_none() {
            self.updates = Some(self.start());
        }
        self.updates.as_mut()?.recv().await
    }
}

/// Blocking-query loop feeding an [`AgentConfigWatcher`]
async fn poll_agent(
    client: Arc<dyn ControlPlaneClient>,
    proxy_id: String,
    tx: mpsc::Sender<Config>,
    shutdown: CancellationToken,
) {
    let mut index: Option<u64> = None;
    let mut last_hash: Option<String> = None;
    let mut backoff = defaults::RETRY_MIN_BACKOFF;

    info!("Watching control plane for proxy {} configuration", proxy_id);

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = client.proxy_config(&proxy_id, index) => result,
        };

        match result {
            Ok((resp, new_index)) => {
                backoff = defaults::RETRY_MIN_BACKOFF;
                let same_index = index == Some(new_index);
                // An index that goes backwards means the agent's state was reset.
                index = match index {
                    Some(old) if new_index < old => Some(0),
                    _ => Some(new_index),
                };

                if last_hash.as_deref() == Some(resp.content_hash.as_str()) {
                    debug!("Proxy config for {} unchanged at index {}", proxy_id, new_index);
                    if same_index {
                        // The agent answered without blocking.
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(defaults::BLOCKING_QUERY_MIN_INTERVAL) => {}
                        }
                    }
                    continue;
                }

                match Config::from_agent(&proxy_id, &resp) {
                    Ok(config) => {
                        last_hash = Some(resp.content_hash.clone());
                        if tx.send(config).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Invalid proxy config for {}: {}", proxy_id, e),
                }
            }
            Err(e) => {
                warn!(
                    "Failed to fetch proxy config for {}: {}. Retrying in {:?}",
                    proxy_id, e, backoff
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = defaults::next_backoff(backoff);
            }
        }
    }

    debug!("Stopped watching proxy {} configuration", proxy_id);
}
