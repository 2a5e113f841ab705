//! Logging helpers
//!
//! The proxy logs through the `log` facade; the binary installs `env_logger`.

/// Initialize the global logger
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Parameters
///
/// * `level` - Default log filter, e.g. `info` or `connect_proxy=debug`
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialization (e.g. from tests) is not an error worth surfacing.
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
