//! Shared helpers for integration tests
//!
//! Fakes for the proxy's collaborators and an on-the-fly certificate
//! authority for TLS tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use connect_proxy::client::{
    AgentProxyConfig, CaRoots, ControlPlaneClient, Endpoint, EndpointQuery, LeafCert,
};
use connect_proxy::config::{Config, ConfigWatcher, PublicListenerConfig, UpstreamConfig};
use connect_proxy::proxy::{Listener, ListenerFactory, Resolver};
use connect_proxy::{ProxyError, Result, Service, TlsMaterial};

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Snapshot for `service_id` with a public listener on port 20000 and one
/// upstream per entry of `ports`
pub fn snapshot(service_id: &str, ports: &[i32]) -> Config {
    Config {
        proxy_id: format!("{}-proxy", service_id),
        proxied_service_name: service_id.to_string(),
        proxied_service_id: service_id.to_string(),
        public_listener: PublicListenerConfig {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 20000,
            local_service_address: "127.0.0.1:8080".to_string(),
            ..Default::default()
        },
        upstreams: ports
            .iter()
            .map(|port| UpstreamConfig {
                local_bind_port: *port,
                destination_name: format!("db-{}", port),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Config watcher fed by the test through a channel
pub struct ChannelWatcher {
    rx: mpsc::UnboundedReceiver<Config>,
}

impl ChannelWatcher {
    pub fn new() -> (mpsc::UnboundedSender<Config>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl ConfigWatcher for ChannelWatcher {
    async fn next(&mut self) -> Option<Config> {
        self.rx.recv().await
    }
}

/// Control-plane client with fixed answers
///
/// Identity requests always fail, so a service built from it never becomes
/// ready; endpoint lookups return `endpoints`.
#[derive(Default)]
pub struct FakeClient {
    pub endpoints: Vec<Endpoint>,
}

#[async_trait]
impl ControlPlaneClient for FakeClient {
    async fn proxy_config(
        &self,
        _proxy_id: &str,
        _wait_index: Option<u64>,
    ) -> Result<(AgentProxyConfig, u64)> {
        Err(ProxyError::ControlPlane("not available in tests".to_string()))
    }

    async fn leaf_cert(&self, _service_id: &str) -> Result<LeafCert> {
        Err(ProxyError::ControlPlane("not available in tests".to_string()))
    }

    async fn ca_roots(&self) -> Result<CaRoots> {
        Err(ProxyError::ControlPlane("not available in tests".to_string()))
    }

    async fn connect_endpoints(&self, _query: &EndpointQuery) -> Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}

/// Listener that serves until closed and counts close calls
pub struct FakeListener {
    pub name: String,
    addr: SocketAddr,
    token: CancellationToken,
    closes: AtomicUsize,
}

impl FakeListener {
    fn new(name: String, port: u16) -> Self {
        Self {
            name,
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            token: CancellationToken::new(),
            closes: AtomicUsize::new(0),
        }
    }

    /// Number of times `close` was called
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Make `serve` return as if the listener failed on its own
    pub fn finish(&self) {
        self.token.cancel();
    }
}

#[async_trait]
impl Listener for FakeListener {
    fn bind_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn serve(&self) -> Result<()> {
        self.token.cancelled().await;
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
    }
}

/// Factory recording every request and every listener it creates
#[derive(Default)]
pub struct RecordingFactory {
    requests: Mutex<Vec<String>>,
    listeners: Mutex<Vec<Arc<FakeListener>>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

pub const PUBLIC: &str = "public";

impl RecordingFactory {
    /// Make requests for `name` fail until [`RecordingFactory::recover`]
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn recover(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    /// Block the calling thread for `delay` whenever `name` is requested
    pub fn slow(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Names of every listener requested, in order, including failures
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// How often a listener for `name` was requested
    pub fn request_count(&self, name: &str) -> usize {
        self.requests().iter().filter(|n| n.as_str() == name).count()
    }

    /// Every listener created so far
    pub fn listeners(&self) -> Vec<Arc<FakeListener>> {
        self.listeners.lock().unwrap().clone()
    }

    /// Listeners created for `name`
    pub fn listeners_named(&self, name: &str) -> Vec<Arc<FakeListener>> {
        self.listeners()
            .into_iter()
            .filter(|l| l.name == name)
            .collect()
    }

    fn create(&self, name: String, port: u16) -> Result<Arc<dyn Listener>> {
        self.requests.lock().unwrap().push(name.clone());
        let delay = self.delays.lock().unwrap().get(&name).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.failing.lock().unwrap().contains(&name) {
            return Err(ProxyError::Other(format!("cannot bind {}", name)));
        }
        let listener = Arc::new(FakeListener::new(name, port));
        self.listeners.lock().unwrap().push(Arc::clone(&listener));
        Ok(listener)
    }
}

impl ListenerFactory for RecordingFactory {
    fn public_listener(
        &self,
        _service: &Arc<Service>,
        config: &PublicListenerConfig,
    ) -> Result<Arc<dyn Listener>> {
        self.create(PUBLIC.to_string(), config.bind_port)
    }

    fn upstream_listener(
        &self,
        _service: &Arc<Service>,
        config: &UpstreamConfig,
        _resolver: Arc<dyn Resolver>,
    ) -> Result<Arc<dyn Listener>> {
        let port = u16::try_from(config.local_bind_port).unwrap();
        self.create(config.to_string(), port)
    }
}

/// Identity string of the upstream `snapshot` creates for `port`
pub fn upstream_key(port: i32) -> String {
    format!("127.0.0.1:{}->service:default/db-{}", port, port)
}

/// Test certificate authority
pub struct TestCa {
    cert: X509,
    key: PKey<Private>,
}

fn new_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn cert_builder(cn: &str, serial: u32, key: &PKey<Private>) -> X509Builder {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(serial).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder
}

impl TestCa {
    pub fn new(cn: &str) -> Self {
        let key = new_key();
        let mut builder = cert_builder(cn, 1, &key);
        let mut issuer = X509NameBuilder::new().unwrap();
        issuer.append_entry_by_text("CN", cn).unwrap();
        builder.set_issuer_name(&issuer.build()).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        Self {
            cert: builder.build(),
            key,
        }
    }

    /// Issue a leaf for `uri` and return `(cert_pem, key_pem)`
    pub fn issue(&self, cn: &str, serial: u32, uri: &str) -> (Vec<u8>, Vec<u8>) {
        let key = new_key();
        let mut builder = cert_builder(cn, serial, &key);
        builder.set_issuer_name(self.cert.subject_name()).unwrap();
        let san = SubjectAlternativeName::new()
            .uri(uri)
            .build(&builder.x509v3_context(Some(&*self.cert), None))
            .unwrap();
        builder.append_extension(san).unwrap();
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();
        (
            builder.build().to_pem().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap(),
        )
    }

    pub fn pem(&self) -> Vec<u8> {
        self.cert.to_pem().unwrap()
    }

    /// TLS material for a service identified by `uri`
    pub fn material(&self, cn: &str, serial: u32, uri: &str) -> TlsMaterial {
        let (cert, key) = self.issue(cn, serial, uri);
        TlsMaterial::from_pem(&self.pem(), &cert, &key).unwrap()
    }
}
