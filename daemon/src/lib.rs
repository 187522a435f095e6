//! # Firewall Daemon Library
//!
//! Hosts the policy decision engine: profile snapshots on disk, list refresh,
//! the administrative message surface and out-of-band resolution delivery.

// Core modules
pub mod admin;
pub mod config;
pub mod error;
pub mod notifier;
pub mod refresh;
pub mod runtime;
pub mod snapshot;
pub mod stdio;

// Re-export commonly used types
pub use admin::{AdminHandle, AdminReply, AdminRequest};
pub use config::{DaemonConfig, StorageConfig};
pub use error::{DaemonError, DaemonResult};
pub use notifier::BroadcastNotifier;
pub use runtime::Firewalld;
pub use snapshot::SnapshotStore;

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
