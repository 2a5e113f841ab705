//! Configuration module
//!
//! # Data Flow
//! ```text
//! JSON file ──────────────┐
//!                         ├─→ Config (immutable snapshot) ─→ ConfigWatcher ─→ Proxy::serve
//! agent proxy-config API ─┘
//! ```
//!
//! Snapshots are never modified after they are published. The proxy derives
//! copies with defaults applied (`with_defaults`) before it builds
//! listeners from them.

pub mod defaults;
pub mod error;
mod loader;
pub mod types;
pub mod watcher;

pub use error::ConfigError;
pub use types::{Config, DestinationType, PublicListenerConfig, UpstreamConfig};
pub use watcher::{AgentConfigWatcher, ConfigWatcher, StaticConfigWatcher};
