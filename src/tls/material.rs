//! Mutual-TLS material for one service identity
//!
//! A [`TlsMaterial`] bundles the leaf certificate, its key and the trusted
//! roots, together with the acceptor and connector built from them. Inbound
//! connections always require a client certificate; outbound connections
//! verify the peer against the mesh roots only.

use std::fmt;
use std::fs;
use std::path::Path;

use log::debug;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{
    SslAcceptor, SslConnector, SslContextBuilder, SslMethod, SslVerifyMode,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

use crate::common::{ProxyError, Result};
use super::cert::{load_certs_pem, subject_string, uri_sans};

/// TLS identity plus the acceptor and connector derived from it
pub struct TlsMaterial {
    leaf: X509,
    roots: Vec<X509>,
    acceptor: SslAcceptor,
    connector: SslConnector,
}

impl TlsMaterial {
    /// Build material from PEM encoded data
    ///
    /// # Parameters
    ///
    /// * `roots_pem` - One or more trusted CA certificates
    /// * `cert_pem` - Leaf certificate, optionally followed by intermediates
    /// * `key_pem` - Private key of the leaf
    pub fn from_pem(roots_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let roots = load_certs_pem(roots_pem)?;
        let mut chain = load_certs_pem(cert_pem)?.into_iter();
        let leaf = chain
            .next()
            .ok_or_else(|| ProxyError::Certificate("missing leaf certificate".to_string()))?;
        let intermediates: Vec<X509> = chain.collect();
        let key = PKey::private_key_from_pem(key_pem)?;

        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        configure_identity(&mut acceptor, &leaf, &intermediates, &key, &roots)?;
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);

        let mut connector = SslConnector::builder(SslMethod::tls())?;
        configure_identity(&mut connector, &leaf, &intermediates, &key, &roots)?;
        connector.set_verify(SslVerifyMode::PEER);

        debug!(
            "Built TLS material for {:?} with {} trusted roots",
            uri_sans(&leaf),
            roots.len()
        );

        Ok(Self {
            leaf,
            roots,
            acceptor: acceptor.build(),
            connector: connector.build(),
        })
    }

    /// Build material from PEM files on disk
    pub fn from_files(ca_file: &Path, cert_file: &Path, key_file: &Path) -> Result<Self> {
        let read = |path: &Path| {
            fs::read(path).map_err(|e| {
                ProxyError::Certificate(format!("Failed to read {}: {}", path.display(), e))
            })
        };
        Self::from_pem(&read(ca_file)?, &read(cert_file)?, &read(key_file)?)
    }

    /// Leaf certificate presented to peers
    pub fn leaf(&self) -> &X509 {
        &self.leaf
    }

    /// Trusted CA roots
    pub fn roots(&self) -> &[X509] {
        &self.roots
    }

    /// First URI SAN of the leaf, i.e. the service identity
    pub fn leaf_uri(&self) -> Option<String> {
        uri_sans(&self.leaf).into_iter().next()
    }

    /// Subjects of all trusted roots, comma separated
    pub fn root_subjects(&self) -> String {
        self.roots
            .iter()
            .map(|root| subject_string(root))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Acceptor for inbound mutual-TLS connections
    pub fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }

    /// Connector for outbound mutual-TLS connections
    pub fn connector(&self) -> &SslConnector {
        &self.connector
    }
}

// SslAcceptor and SslConnector don't implement Debug
impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("leaf", &self.leaf_uri())
            .field("roots", &self.root_subjects())
            .finish()
    }
}

/// Install certificate, key and an exclusive trust store on a context builder
fn configure_identity(
    builder: &mut SslContextBuilder,
    leaf: &X509,
    intermediates: &[X509],
    key: &PKey<Private>,
    roots: &[X509],
) -> Result<()> {
    builder.set_certificate(leaf)?;
    for cert in intermediates {
        builder.add_extra_chain_cert(cert.clone())?;
    }
    builder.set_private_key(key)?;
    builder.check_private_key()?;

    let mut store = X509StoreBuilder::new()?;
    for root in roots {
        store.add_cert(root.clone())?;
    }
    builder.set_cert_store(store.build());
    Ok(())
}
