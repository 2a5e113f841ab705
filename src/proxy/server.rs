//! Proxy server module
//!
//! [`Proxy`] runs the reconfiguration loop: it applies configuration
//! snapshots from a [`ConfigWatcher`] in delivery order, binds the identity
//! service and public listener on the first one, and reconciles the set of
//! upstream listeners on every one.
//!
//! ```text
//! Uninitialized ──first snapshot──→ Initialized ──snapshot──→ Reconciling ─┐
//!       │                               │                        ↑        │
//!       │                               │                        └────────┘
//!       └───────────── close() ─────────┴──────→ Stopped ←───────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::ControlPlaneClient;
use crate::common::{ProxyError, Result};
use crate::config::{
    AgentConfigWatcher, Config, ConfigError, ConfigWatcher, StaticConfigWatcher, UpstreamConfig,
};
use crate::identity::Service;
use crate::tls::fingerprint;
use super::listener::{Listener, ListenerFactory, TcpListenerFactory};
use super::resolver::resolver_from_client;

const PUBLIC_LISTENER_NAME: &str = "public listener";

/// A started listener and the token that stops it
struct ActiveListener {
    listener: Arc<dyn Listener>,
    token: CancellationToken,
}

impl ActiveListener {
    /// Ask the listener to close; its watcher task performs the close
    fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the listener has been stopped or its serve loop has ended
    fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// State owned by the reconfiguration loop
#[derive(Default)]
struct Reconciler {
    current: Option<Config>,
    public: Option<ActiveListener>,
    upstreams: HashMap<String, ActiveListener>,
}

/// Sidecar proxy for one service
///
/// Handles configuration updates from the control plane (or a static file)
/// and keeps the public and upstream listeners in line with them.
pub struct Proxy {
    /// ID of this proxy, used to look up its configuration
    proxy_id: String,
    /// Control-plane client shared with the identity service and resolvers
    client: Arc<dyn ControlPlaneClient>,
    /// Snapshot source; taken by the first call to `serve`
    watcher: Mutex<Option<Box<dyn ConfigWatcher>>>,
    /// Creates listeners from configuration
    factory: Arc<dyn ListenerFactory>,
    /// Identity of the proxied service, once bound
    service: Mutex<Option<Arc<Service>>>,
    /// Global stop signal; every listener token is a child of it
    shutdown: CancellationToken,
    /// Every task spawned for listeners, awaited by `close`
    tasks: TaskTracker,
}

impl Proxy {
    /// Create a proxy whose configuration is delivered by the control plane
    ///
    /// # Errors
    ///
    /// Returns an error if `proxy_id` is empty.
    pub fn new(client: Arc<dyn ControlPlaneClient>, proxy_id: &str) -> Result<Self> {
        let watcher = AgentConfigWatcher::new(Arc::clone(&client), proxy_id)?;
        Ok(Self::from_parts(
            proxy_id,
            client,
            Box::new(watcher),
            Arc::new(TcpListenerFactory),
            None,
        ))
    }

    /// Create a proxy from a static JSON configuration file
    ///
    /// The file must name the CA, certificate and key files of the proxied
    /// service; the control plane is only used to resolve upstreams.
    pub fn from_config_file<P: AsRef<Path>>(
        client: Arc<dyn ControlPlaneClient>,
        path: P,
    ) -> Result<Self> {
        let config = Config::from_file(path)?;

        let (ca_file, cert_file, key_file) = match (
            &config.dev_ca_file,
            &config.dev_service_cert_file,
            &config.dev_service_key_file,
        ) {
            (Some(ca), Some(cert), Some(key)) => (ca, cert, key),
            _ => {
                return Err(ConfigError::MissingRequiredValue(
                    "dev_ca_file, dev_service_cert_file and dev_service_key_file".to_string(),
                )
                .into())
            }
        };
        let service =
            Service::from_cert_files(&config.proxied_service_id, ca_file, cert_file, key_file)?;

        let proxy_id = config.proxy_id.clone();
        Ok(Self::from_parts(
            &proxy_id,
            client,
            Box::new(StaticConfigWatcher::new(config)),
            Arc::new(TcpListenerFactory),
            Some(service),
        ))
    }

    /// Assemble a proxy from its collaborators
    ///
    /// `service`, when given, is used as the identity if the first snapshot
    /// names the same service ID.
    pub fn from_parts(
        proxy_id: &str,
        client: Arc<dyn ControlPlaneClient>,
        watcher: Box<dyn ConfigWatcher>,
        factory: Arc<dyn ListenerFactory>,
        service: Option<Arc<Service>>,
    ) -> Self {
        Self {
            proxy_id: proxy_id.to_string(),
            client,
            watcher: Mutex::new(Some(watcher)),
            factory,
            service: Mutex::new(service),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// ID of this proxy
    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Run the reconfiguration loop until [`Proxy::close`] is called.
    ///
    /// Returns `Ok(())` when stopped, or the error that prevented the proxy
    /// from initializing on its first snapshot.
    ///
    /// # Errors
    ///
    /// Fails if the identity service or the public listener cannot be
    /// created, or if `serve` has already been called.
    pub async fn serve(&self) -> Result<()> {
        // Keeps `close` waiting until no snapshot can be mid-apply.
        let _serving = self.tasks.token();
        let mut watcher = lock(&self.watcher)
            .take()
            .ok_or_else(|| ProxyError::Other(format!("proxy {} is already serving", self.proxy_id)))?;
        let mut state = Reconciler::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                next = watcher.next() => next,
            };

            match next {
                Some(config) => self.apply(&mut state, config)?,
                None => {
                    info!("Configuration source for proxy {} closed", self.proxy_id);
                    self.shutdown.cancelled().await;
                    return Ok(());
                }
            }
        }
    }

    /// Stop the proxy and wait for every listener to finish.
    ///
    /// Also waits for a running [`Proxy::serve`] to return, so no listener is
    /// started once this completes. Calling this more than once is harmless.
    pub async fn close(&self) {
        self.shutdown.cancel();

        if let Some(service) = lock(&self.service).take() {
            service.close();
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!("Proxy {} stopped", self.proxy_id);
    }

    fn apply(&self, state: &mut Reconciler, config: Config) -> Result<()> {
        debug!("Proxy {} received configuration: {:?}", self.proxy_id, config);

        let service = match &state.current {
            None => self.initialize(state, &config)?,
            Some(current) => {
                if config.proxied_service_id != current.proxied_service_id {
                    error!(
                        "Ignoring configuration for service {}: proxy is bound to service {}",
                        config.proxied_service_id, current.proxied_service_id
                    );
                    return Ok(());
                }
                if config.public_listener != current.public_listener {
                    warn!("Public listener configuration changed; restart the proxy to apply it");
                }
                if let Some(public) = state.public.as_ref().filter(|public| public.is_stopped()) {
                    warn!(
                        "{} on {} is no longer running",
                        PUBLIC_LISTENER_NAME,
                        public.listener.bind_addr()
                    );
                }
                match lock(&self.service).clone() {
                    Some(service) => service,
                    // Closed underneath us: shutdown is in progress.
                    None => return Ok(()),
                }
            }
        };

        self.reconcile_upstreams(state, &service, &config.upstreams);
        state.current = Some(config);
        Ok(())
    }

    /// Bind the identity and start the public listener. Any error is fatal.
    fn initialize(&self, state: &mut Reconciler, config: &Config) -> Result<Arc<Service>> {
        let service = self.bind_service(&config.proxied_service_id)?;
        self.spawn_readiness_log(&service);

        if self.shutdown.is_cancelled() {
            return Ok(service);
        }
        let public = config.public_listener.clone().with_defaults();
        let listener = self.factory.public_listener(&service, &public)?;
        state.public = Some(self.start_listener(PUBLIC_LISTENER_NAME, listener));

        Ok(service)
    }

    fn bind_service(&self, service_id: &str) -> Result<Arc<Service>> {
        let mut slot = lock(&self.service);

        if let Some(service) = slot.as_ref() {
            if service.service_id() == service_id {
                return Ok(Arc::clone(service));
            }
            return Err(ProxyError::Identity(format!(
                "configuration names service {:?} but the identity belongs to {:?}",
                service_id,
                service.service_id()
            )));
        }

        let service = Service::new(service_id, Arc::clone(&self.client))?;
        if self.shutdown.is_cancelled() {
            service.close();
        }
        *slot = Some(Arc::clone(&service));
        Ok(service)
    }

    fn spawn_readiness_log(&self, service: &Arc<Service>) {
        let service = Arc::clone(service);
        self.tasks.spawn(async move {
            match service.ready_wait().await {
                Ok(material) => {
                    info!("Proxy loaded config and ready to serve");
                    debug!("TLS identity: {}", material.leaf_uri().unwrap_or_default());
                    if let Ok(fingerprint) = fingerprint(material.leaf()) {
                        debug!("TLS leaf fingerprint: {}", fingerprint);
                    }
                    debug!("TLS roots: {}", material.root_subjects());
                }
                Err(e) => debug!(
                    "Identity for service {} never became ready: {}",
                    service.service_id(),
                    e
                ),
            }
        });
    }

    /// Bring the upstream listeners in line with `upstreams`
    ///
    /// Listeners are keyed by the upstream identity string: keys already
    /// running are left alone, keys no longer present are stopped, new keys
    /// are started. Failures are logged and retried on the next snapshot.
    fn reconcile_upstreams(
        &self,
        state: &mut Reconciler,
        service: &Arc<Service>,
        upstreams: &[UpstreamConfig],
    ) {
        state.upstreams.retain(|key, active| {
            let running = !active.is_stopped();
            if !running {
                debug!("Upstream {} is no longer running", key);
            }
            running
        });

        let mut desired = Vec::with_capacity(upstreams.len());
        let mut keys = HashSet::with_capacity(upstreams.len());
        for upstream in upstreams {
            let upstream = upstream.clone().with_defaults();
            let key = upstream.to_string();
            if !upstream.has_bind_port() {
                error!("upstream {} has no local_bind_port. Can't start upstream.", key);
                continue;
            }
            if keys.insert(key.clone()) {
                desired.push((key, upstream));
            }
        }

        // Stop first so a replacement can reuse the port.
        let removed: Vec<String> = state
            .upstreams
            .keys()
            .filter(|key| !keys.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(active) = state.upstreams.remove(&key) {
                info!("Stopping upstream {} on {}", key, active.listener.bind_addr());
                active.stop();
            }
        }

        for (key, upstream) in desired {
            if self.shutdown.is_cancelled() {
                debug!("Proxy {} is stopping; not starting upstream {}", self.proxy_id, key);
                break;
            }
            if state.upstreams.contains_key(&key) {
                continue;
            }
            let resolver = resolver_from_client(Arc::clone(&self.client), &upstream);
            match self.factory.upstream_listener(service, &upstream, resolver) {
                Ok(listener) => {
                    let active = self.start_listener(&key, listener);
                    state.upstreams.insert(key, active);
                }
                Err(e) => error!("failed to start upstream {}: {}", key, e),
            }
        }
    }

    /// Spawn the serve and close tasks of a listener
    ///
    /// Never fails: errors from the serve loop are only logged.
    fn start_listener(&self, name: &str, listener: Arc<dyn Listener>) -> ActiveListener {
        info!("{} starting on {}", name, listener.bind_addr());
        let token = self.shutdown.child_token();

        {
            let listener = Arc::clone(&listener);
            let token = token.clone();
            let name = name.to_string();
            self.tasks.spawn(async move {
                match listener.serve().await {
                    Ok(()) => info!("{} stopped", name),
                    Err(e) => error!("{} stopped with error: {}", name, e),
                }
                token.cancel();
            });
        }

        {
            let listener = Arc::clone(&listener);
            let token = token.clone();
            self.tasks.spawn(async move {
                token.cancelled().await;
                listener.close();
            });
        }

        ActiveListener { listener, token }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("proxy_id", &self.proxy_id)
            .field("stopped", &self.shutdown.is_cancelled())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
