//! Node plugin configuration.
//!
//! The binary fills this from its command line; tests build it with
//! [`NodeConfig::for_node`] and override single fields.

use std::time::Duration;

use crate::mounter::MounterKind;
use crate::mounter::fuse::DEFAULT_MOUNT_WAIT;

/// Default bound on a single bucket existence / descriptor lookup.
pub const DEFAULT_BUCKET_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by every request handled by one node server.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node identifier reported by `get_info`.
    pub node_id: String,
    /// Maximum number of volumes per node; `0` means unlimited.
    pub max_volumes: u64,
    /// Upper bound on each call to the bucket client.
    pub bucket_check_timeout: Duration,
    /// How long a FUSE tool gets to make its mount visible.
    pub mount_wait_timeout: Duration,
    /// Backend used when neither the bucket nor the credentials name one.
    pub default_mounter: MounterKind,
}

impl NodeConfig {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            max_volumes: 0,
            bucket_check_timeout: DEFAULT_BUCKET_CHECK_TIMEOUT,
            mount_wait_timeout: DEFAULT_MOUNT_WAIT,
            default_mounter: MounterKind::default(),
        }
    }
}
