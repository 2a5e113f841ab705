//! Service identity module
//!
//! An identity [`Service`] owns the TLS material of the proxied service and
//! announces when it is ready. Listeners share one service and wait on it
//! before completing any handshake.

mod service;

pub use service::Service;
