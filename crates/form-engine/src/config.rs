//! Session configuration

use serde::{Deserialize, Serialize};

/// Default bound on annotation/condition re-evaluation passes per update
pub const DEFAULT_MAX_STABILIZATION_PASSES: usize = 100;

/// Default zstd level for transaction snapshots
pub const DEFAULT_SNAPSHOT_COMPRESSION_LEVEL: i32 = 3;

/// Tunables of a [`Session`](crate::session::Session)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Passes after which an update that keeps changing annotations fails
    /// with `AnnotationsDidNotStabilize`
    pub max_stabilization_passes: usize,
    /// zstd compression level of transaction snapshots
    pub snapshot_compression_level: i32,
    /// Deliver the current value to a subscriber when it subscribes
    pub notify_on_subscribe: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_stabilization_passes: DEFAULT_MAX_STABILIZATION_PASSES,
            snapshot_compression_level: DEFAULT_SNAPSHOT_COMPRESSION_LEVEL,
            notify_on_subscribe: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stabilization_passes(mut self, passes: usize) -> Self {
        self.max_stabilization_passes = passes.max(1);
        self
    }

    pub fn with_snapshot_compression_level(mut self, level: i32) -> Self {
        self.snapshot_compression_level = level;
        self
    }

    pub fn with_notify_on_subscribe(mut self, notify: bool) -> Self {
        self.notify_on_subscribe = notify;
        self
    }
}
