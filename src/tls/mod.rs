//! TLS handling module
//!
//! This module holds the mutual-TLS material of a service identity and the
//! certificate helpers used to inspect it.

pub mod cert;
mod material;

pub use cert::{fingerprint, load_certs_file, load_certs_pem, subject_string, uri_sans};
pub use material::TlsMaterial;
