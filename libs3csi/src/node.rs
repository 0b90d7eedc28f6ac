//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a bucket available to Pod containers:
//!
//! 1. **Stage**: FUSE-mount the bucket at a node-global staging path.
//! 2. **Publish**: bind-mount the staging path into the Pod's volume path.
//! 3. **Unpublish**: remove the bind-mount.
//! 4. **Unstage**: unmount the FUSE mount.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::CsiError;
use crate::types::{
    NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest, NodeServiceCapability,
    NodeStageVolumeRequest, NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest,
};

/// Point in time after which a request should not start new work.
///
/// Checked only between steps: a mount that has already been issued always
/// runs to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Fail with [`CsiError::DeadlineExceeded`] if the deadline has passed.
    pub fn check(&self, next_step: &str) -> Result<(), CsiError> {
        if self.is_expired() {
            return Err(CsiError::DeadlineExceeded(format!(
                "deadline passed before {next_step}"
            )));
        }
        Ok(())
    }
}

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: FUSE-mount the bucket at the staging path.
    ///
    /// Idempotent: calling it again for an already-staged volume
    /// succeeds without mounting again.
    async fn stage_volume(
        &self,
        req: NodeStageVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the FUSE filesystem from the staging path.
    ///
    /// Idempotent: calling it on an already-unstaged volume
    /// succeeds without error.
    async fn unstage_volume(
        &self,
        req: NodeUnstageVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError>;

    /// Publish a volume: bind-mount the staged path into the container.
    ///
    /// Idempotent: calling it again for the same `target_path`
    /// succeeds without error.
    async fn publish_volume(
        &self,
        req: NodePublishVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the bind-mount from the container path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
        deadline: Deadline,
    ) -> Result<(), CsiError>;

    /// RPC capabilities of this node service.
    fn get_capabilities(&self) -> Vec<NodeServiceCapability>;

    /// Volume expansion is not supported by object storage volumes.
    async fn expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<(), CsiError> {
        Err(CsiError::Unimplemented(format!(
            "NodeExpandVolume is not implemented (volume {})",
            req.volume_id
        )))
    }

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
