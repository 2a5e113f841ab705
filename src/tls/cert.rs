//! Certificate handling module
//!
//! Helpers for loading X.509 certificates and reading the fields the proxy
//! logs and checks: URI SANs (service identities), subjects and fingerprints.

use std::fs;
use std::path::Path;

use openssl::hash::MessageDigest;
use openssl::x509::{X509, X509Ref};

use crate::common::{ProxyError, Result};

/// Parse every certificate in a PEM bundle
///
/// # Errors
///
/// Returns an error if the bundle is malformed or holds no certificate.
pub fn load_certs_pem(pem: &[u8]) -> Result<Vec<X509>> {
    let certs = X509::stack_from_pem(pem)?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate("PEM bundle contains no certificates".to_string()));
    }
    Ok(certs)
}

/// Read and parse a PEM certificate file
pub fn load_certs_file(path: &Path) -> Result<Vec<X509>> {
    let pem = fs::read(path).map_err(|e| {
        ProxyError::Certificate(format!("Failed to read {}: {}", path.display(), e))
    })?;
    load_certs_pem(&pem)
}

/// URI subject alternative names of a certificate
pub fn uri_sans(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.uri().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Subject name rendered as `CN=...,O=...`
pub fn subject_string(cert: &X509Ref) -> String {
    cert.subject_name()
        .entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = String::from_utf8_lossy(entry.data().as_slice());
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// SHA-256 fingerprint as colon separated hex
pub fn fingerprint(cert: &X509Ref) -> Result<String> {
    let digest = cert.digest(MessageDigest::sha256())?;
    Ok(digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":"))
}
