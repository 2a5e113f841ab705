//! Identity service
//!
//! Fetches the CA roots and leaf certificate of a service from the control
//! plane and publishes the resulting [`TlsMaterial`] once both are available.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::ControlPlaneClient;
use crate::common::{ProxyError, Result};
use crate::config::defaults;
use crate::tls::TlsMaterial;

/// TLS identity of the proxied service
#[derive(Debug)]
pub struct Service {
    service_id: String,
    material: watch::Sender<Option<Arc<TlsMaterial>>>,
    shutdown: CancellationToken,
}

impl Service {
    /// Create a service that obtains its identity from the control plane.
    ///
    /// Fetching starts immediately in the background and is retried until it
    /// succeeds or the service is closed.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Identity`] if `service_id` is empty.
    pub fn new(service_id: &str, client: Arc<dyn ControlPlaneClient>) -> Result<Arc<Self>> {
        let service = Self::empty(service_id)?;
        tokio::spawn(fetch_identity(Arc::clone(&service), client));
        Ok(service)
    }

    /// Create a service from PEM files; it is ready immediately
    pub fn from_cert_files(
        service_id: &str,
        ca_file: &Path,
        cert_file: &Path,
        key_file: &Path,
    ) -> Result<Arc<Self>> {
        let material = TlsMaterial::from_files(ca_file, cert_file, key_file)?;
        Self::from_material(service_id, material)
    }

    /// Create a service around existing material; it is ready immediately
    pub fn from_material(service_id: &str, material: TlsMaterial) -> Result<Arc<Self>> {
        let service = Self::empty(service_id)?;
        service.publish(material);
        Ok(service)
    }

    fn empty(service_id: &str) -> Result<Arc<Self>> {
        if service_id.is_empty() {
            return Err(ProxyError::Identity("service ID must not be empty".to_string()));
        }
        let (material, _) = watch::channel(None);
        Ok(Arc::new(Self {
            service_id: service_id.to_string(),
            material,
            shutdown: CancellationToken::new(),
        }))
    }

    /// ID of the service this identity belongs to
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Current material, if the identity is ready
    pub fn material(&self) -> Option<Arc<TlsMaterial>> {
        self.material.borrow().clone()
    }

    /// Wait until the identity is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Identity`] if the service is closed first.
    pub async fn ready_wait(&self) -> Result<Arc<TlsMaterial>> {
        let mut rx = self.material.subscribe();
        let closed = || ProxyError::Identity(format!("service {} closed", self.service_id));

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(closed()),
            ready = async {
                rx.wait_for(Option::is_some)
                    .await
                    .map(|material| material.clone())
            } => match ready {
                Ok(Some(material)) => Ok(material),
                _ => Err(closed()),
            },
        }
    }

    /// Whether [`Service::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop background fetching and fail pending readiness waits.
    ///
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing identity service {}", self.service_id);
            self.shutdown.cancel();
        }
    }

    fn publish(&self, material: TlsMaterial) {
        self.material.send_replace(Some(Arc::new(material)));
    }
}

/// Fetch roots and leaf until both succeed, then publish them
async fn fetch_identity(service: Arc<Service>, client: Arc<dyn ControlPlaneClient>) {
    let mut backoff = defaults::RETRY_MIN_BACKOFF;

    loop {
        let attempt = async {
            let roots = client.ca_roots().await?;
            let leaf = client.leaf_cert(&service.service_id).await?;
            let roots_pem = roots
                .roots
                .iter()
                .map(|root| root.root_cert.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            TlsMaterial::from_pem(
                roots_pem.as_bytes(),
                leaf.cert_pem.as_bytes(),
                leaf.private_key_pem.as_bytes(),
            )
        };

        let result = tokio::select! {
            _ = service.shutdown.cancelled() => return,
            result = attempt => result,
        };

        match result {
            Ok(material) => {
                info!(
                    "Identity for service {} ready: {}",
                    service.service_id,
                    material.leaf_uri().unwrap_or_default()
                );
                service.publish(material);
                return;
            }
            Err(e) => {
                warn!(
                    "Failed to load identity for service {}: {}. Retrying in {:?}",
                    service.service_id, e, backoff
                );
                tokio::select! {
                    _ = service.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = defaults::next_backoff(backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CaRoot, CaRoots, LeafCert, MockControlPlaneClient};
    use crate::tls::cert::testing;
    use mockall::Sequence;
    use std::time::Duration;
    use tokio::time::timeout;

    const URI: &str = "spiffe://test.consul/ns/default/dc/dc1/svc/web";

    fn mock_with_identity() -> MockControlPlaneClient {
        let (ca, cert, key) = testing::identity_pem(URI);
        let ca = String::from_utf8(ca).unwrap();
        let cert = String::from_utf8(cert).unwrap();
        let key = String::from_utf8(key).unwrap();

        let mut client = MockControlPlaneClient::new();
        client.expect_ca_roots().returning(move || {
            Ok(CaRoots {
                roots: vec![CaRoot { root_cert: ca.clone(), active: true, ..Default::default() }],
                ..Default::default()
            })
        });
        client
            .expect_leaf_cert()
            .withf(|id| id.to_string() == "web")
            .returning(move |_| {
                Ok(LeafCert {
                    cert_pem: cert.clone(),
                    private_key_pem: key.clone(),
                    service_uri: URI.to_string(),
                    ..Default::default()
                })
            });
        client
    }

    #[tokio::test]
    async fn rejects_empty_service_id() {
        let client: Arc<dyn ControlPlaneClient> = Arc::new(MockControlPlaneClient::new());
        let result = Service::new("", client);
        assert!(matches!(result, Err(ProxyError::Identity(_))));
    }

    #[tokio::test]
    async fn becomes_ready_from_control_plane() {
        let service = Service::new("web", Arc::new(mock_with_identity())).unwrap();

        let material = timeout(Duration::from_secs(5), service.ready_wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(material.leaf_uri().as_deref(), Some(URI));
        assert!(service.material().is_some());
        service.close();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_roots_available() {
        let (ca, cert, key) = testing::identity_pem(URI);
        let ca = String::from_utf8(ca).unwrap();
        let cert = String::from_utf8(cert).unwrap();
        let key = String::from_utf8(key).unwrap();

        let mut client = MockControlPlaneClient::new();
        let mut seq = Sequence::new();
        client
            .expect_ca_roots()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(ProxyError::ControlPlane("agent unavailable".to_string())));
        client
            .expect_ca_roots()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move || {
                Ok(CaRoots {
                    roots: vec![CaRoot { root_cert: ca.clone(), ..Default::default() }],
                    ..Default::default()
                })
            });
        client.expect_leaf_cert().returning(move |_| {
            Ok(LeafCert {
                cert_pem: cert.clone(),
                private_key_pem: key.clone(),
                ..Default::default()
            })
        });

        let service = Service::new("web", Arc::new(client)).unwrap();
        let material = timeout(Duration::from_secs(30), service.ready_wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(material.leaf_uri().as_deref(), Some(URI));
    }

    #[tokio::test]
    async fn close_fails_pending_waits() {
        let mut client = MockControlPlaneClient::new();
        client
            .expect_ca_roots()
            .returning(|| Err(ProxyError::ControlPlane("agent unavailable".to_string())));

        let service = Service::new("web", Arc::new(client)).unwrap();
        let waiter = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.ready_wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        service.close();
        service.close();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(ProxyError::Identity(_))));
        assert!(service.is_closed());
    }

    #[tokio::test]
    async fn from_material_is_ready_immediately() {
        let (ca, cert, key) = testing::identity_pem(URI);
        let material = TlsMaterial::from_pem(&ca, &cert, &key).unwrap();
        let service = Service::from_material("web", material).unwrap();

        assert_eq!(service.service_id(), "web");
        let ready = timeout(Duration::from_millis(100), service.ready_wait()).await;
        assert!(ready.unwrap().is_ok());
    }
}
