//! Default configuration values
//!
//! Single source of truth for the defaults applied to snapshots and to the
//! command line.

use std::time::Duration;

/// Default address of the local control-plane agent
pub const HTTP_ADDR_STR: &str = "127.0.0.1:8500";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Public listener bind address when none is configured
pub const PUBLIC_BIND_ADDRESS: &str = "0.0.0.0";

/// Time allowed to connect to the local service
pub const LOCAL_CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Time allowed for an inbound TLS handshake
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Upstream listener bind address when none is configured
pub const UPSTREAM_BIND_ADDRESS: &str = "127.0.0.1";

/// Namespace used when an upstream does not name one
pub const UPSTREAM_NAMESPACE: &str = "default";

/// Time allowed to reach an upstream endpoint
pub const UPSTREAM_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Maximum time a blocking query may be held open by the agent
pub const BLOCKING_QUERY_WAIT: Duration = Duration::from_secs(60);

/// Minimum time between blocking queries that return at an unchanged index
pub const BLOCKING_QUERY_MIN_INTERVAL: Duration = Duration::from_millis(500);

/// First delay after a failed control-plane request
pub const RETRY_MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound for the control-plane retry delay
pub const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Next retry delay: doubles up to [`RETRY_MAX_BACKOFF`]
pub fn next_backoff(current: Duration) -> Duration {
    std::cmp::min(current * 2, RETRY_MAX_BACKOFF)
}

/// Buffer size used when copying bytes between connections
pub const BUFFER_SIZE: usize = 8192;
